use std::{env, process, time::Duration};

use bluez_live::{
    address::DeviceFilter, uuid::Uuid, Adapter, AdapterEvent, Device, Session,
};

// https://www.bluetooth.com/specifications/assigned-numbers/
const HEART_RATE_SERVICE: Uuid = Uuid::from_u16(0x180D);
const HEART_RATE_MEASUREMENT_CHARACTERISTIC: Uuid = Uuid::from_u16(0x2A37);

const TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> bluez_live::Result<()> {
    env_logger::builder()
        .filter_module("bluez_live", log::LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .init();

    // Without a filter, the first device advertising the heart rate service is used.
    let mut args = env::args().skip(1);
    let filter = args.next().map(|s| DeviceFilter::parse(&s));

    let session = Session::new().await?;
    let adapter = match args.next() {
        Some(name) => Adapter::open(&session, &name).await?,
        None => Adapter::open_default(&session).await?,
    };
    log::info!("using adapter {}", adapter.name());

    let mut events = adapter.events().await?;
    let device = loop {
        let Some(event) = events.next().await else {
            eprintln!("error: adapter went away");
            process::exit(1);
        };
        match event {
            AdapterEvent::PoweredOn { is_state_change } => {
                if is_state_change {
                    log::info!("adapter powered on, starting discovery");
                } else {
                    log::info!("adapter already powered on, starting discovery");
                }
                // PoweredOn can be both replayed and delivered live, and BlueZ rejects a
                // second StartDiscovery with InProgress.
                if let Err(e) = adapter.start_discovery().await {
                    log::warn!("couldn't start discovery: {}", e);
                }
            }
            AdapterEvent::PoweredOff => log::warn!("adapter powered off"),
            AdapterEvent::DeviceFound {
                device,
                is_state_change,
            } => match is_wanted(&device, filter.as_ref()).await {
                Ok(true) => break device,
                Ok(false) => {}
                Err(e) => log::warn!(
                    "couldn't inspect {} device {:?}: {}",
                    if is_state_change { "new" } else { "known" },
                    device,
                    e
                ),
            },
            _ => {}
        }
    };
    drop(events);

    if let Err(e) = adapter.stop_discovery().await {
        log::debug!("failed to stop discovery: {}", e);
    }

    log::info!("connecting to {}", device.alias().await?);
    device.connect().await?;
    device.wait_services_resolved(TIMEOUT).await?;

    let characteristic = device
        .service(HEART_RATE_SERVICE)
        .await?
        .characteristic(HEART_RATE_MEASUREMENT_CHARACTERISTIC)
        .await?;
    log::debug!("characteristic flags: {:?}", characteristic.flags().await?);

    let mut values = characteristic.value_changed().await?;
    while let Some(changed) = values.next().await {
        let Some(meas) = parse_characteristic(&changed.value) else {
            eprintln!("couldn't parse measurement: {:02x?}", changed.value);
            process::exit(1);
        };

        println!("{} BPM", meas.rate);
    }

    eprintln!("error: device went away");
    process::exit(1);
}

async fn is_wanted(device: &Device, filter: Option<&DeviceFilter>) -> bluez_live::Result<bool> {
    let alias = device.alias().await?;
    log::info!("found {} ({})", alias, device.address().await?);
    match filter {
        Some(filter) => Ok(filter.matches(&device.address().await?, &alias)),
        None => Ok(device.service_uuids().await?.contains(&HEART_RATE_SERVICE)),
    }
}

struct HeartRateMeasurement {
    rate: u16,
}

fn parse_characteristic(value: &[u8]) -> Option<HeartRateMeasurement> {
    let flags = *value.get(0)?;
    let flags = Flags::from_bits_retain(flags);

    let rate = if flags.contains(Flags::RATE_U16) {
        let mut b = [0; 2];
        b.copy_from_slice(value.get(1..3)?);
        u16::from_le_bytes(b)
    } else {
        u16::from(*value.get(1)?)
    };
    // Ignore everything else, we don't really care.

    Some(HeartRateMeasurement { rate })
}

bitflags::bitflags! {
    struct Flags: u8 {
        const RATE_U16 = 1 << 0;
        const SENSOR_CONTACT_STATUS = 1 << 1;
        const SENSOR_CONTACT_SUPPORT = 1 << 2;
        const ENERGY_EXPENDED = 1 << 3;
        const RR_INTERVAL = 1 << 4;
    }
}
