pub mod cltctx;

pub use cltctx::{ClientConfig, ClientContext, EchoBenchmarkPlan, RpcReply};
