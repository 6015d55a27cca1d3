use clap::{Arg, Command};
use log::info;
use room_signaling::engine::inproc::InprocMediaServer;
use room_signaling::engine::MediaServer;
use room_signaling::monitoring;
use room_signaling::room::RoomRegistry;
use room_signaling::signaling::SignalingServer;
use room_signaling::ServerConfig;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let matches = Command::new("room-signaling")
        .about("Signaling server for multiparty media rooms")
        .arg(
            Arg::new("port")
                .long("port")
                .takes_value(true)
                .help("WebSocket listen port (overrides WS_PORT)"),
        )
        .get_matches();

    let mut config = ServerConfig::from_env();
    if let Some(port) = matches.value_of("port") {
        config.ws_port = port.parse()?;
    }
    let config = Arc::new(config);
    info!(
        "starting [ws_port:{}, max_bitrate:{}bps, codecs:{:?}]",
        config.ws_port, config.max_bitrate, config.media_codecs
    );

    let media_server: Arc<dyn MediaServer> = Arc::new(InprocMediaServer::new());
    let registry = RoomRegistry::new(media_server, config.clone());

    tokio::spawn(monitoring::run_debug_server(
        registry.clone(),
        config.debug_port,
    ));

    let server = SignalingServer::new(registry, config.ws_port);
    server.run().await?;

    Ok(())
}
