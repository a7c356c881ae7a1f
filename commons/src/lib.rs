pub mod aop;
pub mod bench;
pub mod dispatcher;
pub mod err;
pub mod handler;
pub mod methods;
pub mod proxy;
pub mod rpc;
pub mod tracker;
pub mod utils;
