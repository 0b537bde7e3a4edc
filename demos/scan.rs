use std::{env, process, time::Duration};

use bluez_live::{Adapter, AdapterEvent, Device, Session};

const DEFAULT_ADAPTER: &str = "hci0";

#[tokio::main]
async fn main() -> bluez_live::Result<()> {
    env_logger::builder()
        .filter_module("bluez_live", log::LevelFilter::Info)
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .init();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let seconds = match args.first().map(|s| s.parse::<u64>()) {
        Some(Ok(seconds)) if args.len() <= 2 => seconds,
        _ => {
            eprintln!("usage: scan <seconds-to-scan> [adapter-name]");
            eprintln!("example: scan 15 hci0");
            process::exit(1);
        }
    };
    let adapter_name = args.get(1).map_or(DEFAULT_ADAPTER, |s| s.as_str());

    let session = Session::new().await?;
    let adapter = Adapter::open(&session, adapter_name).await?;

    let devices = adapter.list_devices().await?;
    println!("{} device(s) found ahead of scan.", devices.len());
    for device in &devices {
        println!("{}", describe(device).await);
    }
    println!();

    println!("scanning for {} seconds...", seconds);
    let mut added = adapter.watch_devices_added().await?;
    adapter.start_discovery().await?;

    let mut new_devices = 0;
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = added.next() => match event {
                Some(AdapterEvent::DeviceFound { device, .. }) => {
                    new_devices += 1;
                    println!("[NEW] {}", describe(&device).await);
                }
                Some(_) => {}
                None => {
                    log::warn!("adapter went away during the scan");
                    break;
                }
            },
        }
    }
    drop(added);

    if let Err(e) = adapter.stop_discovery().await {
        log::warn!("failed to stop discovery: {}", e);
    }
    println!("scan complete. {} new device(s) found.", new_devices);

    Ok(())
}

async fn describe(device: &Device) -> String {
    let alias = device.alias().await.unwrap_or_else(|_| "<unknown>".into());
    let address = match device.address().await {
        Ok(addr) => addr.to_string(),
        Err(e) => format!("<{}>", e),
    };
    let rssi = match device.rssi().await {
        Ok(rssi) => rssi.to_string(),
        Err(_) => "n/a".into(),
    };
    format!("{} (address: {}, RSSI: {})", alias, address, rssi)
}
