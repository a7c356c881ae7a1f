use anyhow::Result;
use log::info;
use neurorpc_client::{ClientConfig, ClientContext, EchoBenchmarkPlan};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ClientConfig::from_env();
    info!("Connecting to {}:{}", config.host, config.port);
    let mut client = ClientContext::new(config)?;
    client.connect()?;

    let reply = client.echo("test")?;
    info!(
        "echo -> {} ({} bytes, exec {} us)",
        reply.response.to_wire(),
        reply.size,
        reply.exec_time
    );

    let runs = client.echo_benchmark(&EchoBenchmarkPlan::default())?;
    for stats in &runs {
        info!(
            "run {}: {} samples, payload {:.0} B, total {:.3}ms, exec {:.3}ms, network {:.3}ms",
            stats.run_id,
            stats.completed,
            stats.avg_payload_size,
            stats.avg_total_latency_ms,
            stats.avg_exec_time_ms,
            stats.avg_network_latency_ms
        );
    }
    info!("Statistics: {:?}", client.tracker().get_statistics());

    client.shutdown();
    Ok(())
}
