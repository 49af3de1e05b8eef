use clap::Parser;
use ssc_mesh::config::ServerOptions;
use ssc_mesh::logger;
use ssc_mesh::server::RendezvousServer;
use std::net::SocketAddr;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Rendezvous server for ssc-mesh sessions", long_about = None)]
struct Args {
    /// Адрес для прослушивания
    #[arg(short, long, default_value = "127.0.0.1:1234")]
    bind: SocketAddr,

    /// Имя пользователя должно быть короче этого значения
    #[arg(long, default_value_t = 30)]
    max_username_len: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logger::init();
    let args = Args::parse();

    let server = RendezvousServer::bind(ServerOptions {
        bind: args.bind,
        max_username_len: args.max_username_len,
        ..ServerOptions::default()
    })
    .await?;

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
