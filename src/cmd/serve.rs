//! Serve command - run the REST API

use super::open_engine;
use crate::server;
use clap::Args;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct ServeCommand {
    /// Address to listen on
    #[arg(long, env = "SHARECGT_LISTEN", default_value = "127.0.0.1:5002")]
    listen: SocketAddr,

    /// Requests taking longer than this fail with 408 and may be retried
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

impl ServeCommand {
    pub fn exec(&self, data: &Path) -> anyhow::Result<()> {
        let engine = Arc::new(open_engine(data)?);
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(server::serve(
            engine,
            self.listen,
            Duration::from_secs(self.request_timeout_secs),
        ))
    }
}
