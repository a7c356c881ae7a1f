use log::debug;
use std::time::{Duration, Instant};

macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = Instant::now();
        let result = { $block };
        let duration = start.elapsed();
        debug!(
            "[{}] executed in {:.3}ms ({} us)",
            $name,
            duration.as_secs_f64() * 1000.0,
            duration.as_micros()
        );
        (result, duration)
    }};
}

/// Runs `func` and returns its result together with the elapsed wall time.
pub fn timed<F, R>(name: &str, func: F) -> (R, Duration)
where
    F: FnOnce() -> R,
{
    timed_block!(name, { func() })
}

pub fn with_timing<F, R>(name: &str, func: F) -> R
where
    F: FnOnce() -> R,
{
    timed(name, func).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timed_measures_the_call() {
        let (value, elapsed) = timed("sleepy", || {
            thread::sleep(Duration::from_millis(20));
            7
        });
        assert_eq!(value, 7);
        assert!(elapsed >= Duration::from_millis(20));
        assert_eq!(with_timing("plain", || "done"), "done");
    }
}
