use anyhow::Result;

use djlink::{schema, Config, DjLink, Event};

fn parse_args() -> Config {
    let mut config = Config {
        name: "djlink-cli".to_string(),
        ..Config::default()
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--name" => {
                if let Some(v) = args.next() {
                    config.name = v;
                }
            }
            "--device-num" => {
                if let Some(v) = args.next() {
                    config.device_num = v.parse().unwrap_or(0);
                }
            }
            "--interface" => {
                config.interface_name = args.next();
            }
            "--prefer-cdj-slot" => config.prefer_cdj_slot = true,
            "--send-status" => config.send_status = true,
            "--schema" => {
                println!("{}", serde_json::to_string(&schema::schema()).unwrap());
                std::process::exit(0);
            }
            _ => {}
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = parse_args();
    let mut djlink = DjLink::start(config).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            event = djlink.next() => {
                match event {
                    Ok(event) => emit(&event),
                    Err(e) => emit(&Event::Error { message: e.to_string() }),
                }
            }
        }
    }

    djlink.stop().await;

    Ok(())
}

/// Writes one event as a JSONL line to stdout (spec.md §6/§7).
fn emit(event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("failed to serialize event: {}", e),
    }
}
