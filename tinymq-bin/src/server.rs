#![deny(unsafe_code)]

use std::sync::Arc;

use structopt::StructOpt;

use tinymq::conf::{Options, Settings};
use tinymq::logger::logger_init;
use tinymq::net::Builder;
use tinymq::{Broker, MemoryStore, MqttServer, Result};

#[tokio::main]
async fn main() -> Result<()> {
    //init config
    let settings = Settings::init(Options::from_args())?;

    //init log
    let _logger = logger_init(&settings.log)?;

    settings.logs();

    let broker = Broker::new(settings.clone(), Arc::new(MemoryStore::new()));
    broker.restore().await?;

    let listener_cfg = &settings.listener;
    let listener = Builder::new()
        .name(listener_cfg.name.clone())
        .laddr(listener_cfg.addr)
        .backlog(listener_cfg.backlog)
        .nodelay(listener_cfg.nodelay)
        .reuseaddr(Some(listener_cfg.reuseaddr))
        .reuseport(Some(listener_cfg.reuseport))
        .max_packet_size(listener_cfg.max_packet_size)
        .bind()?;

    let server = Arc::new(MqttServer::new(broker));
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                log::error!("failed to listen for ctrl-c, {:?}", e);
            }
            log::info!("shutting down");
        }
        res = serving => {
            match res {
                Ok(Ok(())) => log::info!("listener stopped"),
                Ok(Err(e)) => log::error!("listener failed, {:?}", e),
                Err(e) => log::error!("listener task failed, {:?}", e),
            }
        }
    }

    if !server.shutdown().await {
        log::warn!("some sessions did not finish before the shutdown timeout");
    }
    log::info!("stats: {}", server.broker().stats());
    Ok(())
}
