// plc_server.rs - Runnable PLC emulator
//
// Serves the test fixture tags plus a few demo tags on the standard
// EtherNet/IP port. Point any CIP client or tag browser at it:
//
//   cargo run --example plc_server [listen-addr] [eds-file]

use std::path::PathBuf;
use std::time::Duration;

use log::{info, LevelFilter};
use rust_ethernet_ip_server::{PlcServer, Tag};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "0.0.0.0:44818".to_string());
    let eds = args.next().map(PathBuf::from);

    let plc = PlcServer::new(eds.as_deref(), true)?;
    plc.set_timeout(Duration::from_secs(60));

    plc.add_tag(Tag::dint("Counter", 0));
    plc.add_tag(Tag::real_array("Temperatures", &[20.5, 21.0, 19.8, 22.3]));
    plc.add_tag(Tag::bool("MotorRunning", false));
    plc.add_tag(Tag::string("Recipe", "IDLE"));

    plc.on_event(|event| {
        match &event.tag {
            Some(tag) => info!(
                "service 0x{:02X} status 0x{:02X} tag {} [{}]",
                event.service, event.status, tag.name, event.index
            ),
            None => info!(
                "service 0x{:02X} status 0x{:02X}",
                event.service, event.status
            ),
        };
    });

    let server = plc.clone();
    let handle = tokio::spawn(async move { server.serve(&addr).await });

    info!("PLC emulator running, press Ctrl+C to stop");
    signal::ctrl_c().await?;
    info!("shutting down");

    plc.close().await;
    handle.await??;
    Ok(())
}
