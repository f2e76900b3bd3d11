//! Common test utilities and helpers

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use toolstream::app::ServerConfig;
use toolstream::server::ApiServer;
use toolstream::subprocess::ToolRunner;

/// Serve `runner` on an ephemeral local port and return its address.
pub async fn spawn_server(runner: Arc<dyn ToolRunner>, config: ServerConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        ApiServer::new(runner, config).serve(listener).await.unwrap();
    });

    addr
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}
