//! CLI for seqsub
//!
//! Subcommands:
//! - `server`: run a broker until ctrl-c
//! - `demo`: run a broker in-process and drive one publish/subscribe
//!   round trip (useful for smoke tests)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use seqsub_broker::protocol::{
    decode, encode, AckProto, ConnectRequest, ConnectResponse, MsgProto, PubAck, PubMsg,
    SubscriptionRequest, SubscriptionResponse,
};
use seqsub_broker::{Broker, BrokerOptions};
use seqsub_bus::memory::MemoryBus;
use seqsub_bus::{Bus, BusMessage};
use seqsub_config::{load_config, load_config_file, Settings};
use seqsub_store::{open_store, Store, StoreLimits};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "seqsub")]
enum Command {
    /// Run the broker
    Server {
        /// Explicit configuration file (default: config/default.*)
        #[arg(long)]
        config: Option<String>,
    },
    /// Run an in-process broker and a scripted client round trip
    Demo,
}

fn store_limits(settings: &Settings) -> StoreLimits {
    StoreLimits {
        max_channels: settings.limits.max_channels,
        max_subs: settings.limits.max_subs,
        max_msgs: settings.limits.max_msgs,
        max_payload_bytes: settings.limits.max_payload_bytes,
        max_age: (settings.limits.max_age_secs > 0)
            .then(|| Duration::from_secs(settings.limits.max_age_secs)),
    }
}

#[tokio::main]
async fn main() {
    seqsub_utils::logging::init("info");

    match Command::parse() {
        Command::Server { config } => {
            if let Err(e) = run_server(config).await {
                error!("server failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Demo => {
            if let Err(e) = run_demo().await {
                error!("demo failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(config: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = match config {
        Some(path) => load_config_file(&path)?,
        None => load_config()?,
    };

    let store: Arc<dyn Store> = open_store(
        &settings.store.backend,
        &settings.store.dir,
        &settings.cluster.id,
        store_limits(&settings),
    )?;
    let bus = Arc::new(MemoryBus::new());
    let broker = Broker::start(BrokerOptions::from_settings(&settings), bus, store)?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting gracefully");
    broker.shutdown();
    Ok(())
}

/// Connect, subscribe to `demo`, publish one message, print what comes
/// back, close down.
async fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::default();
    let store: Arc<dyn Store> = open_store(
        &settings.store.backend,
        &settings.store.dir,
        &settings.cluster.id,
        store_limits(&settings),
    )?;
    let bus = Arc::new(MemoryBus::new());
    let broker = Broker::start(BrokerOptions::from_settings(&settings), Arc::clone(&bus) as Arc<dyn Bus>, store)?;

    // connect, answering heartbeats
    let hb_inbox = bus.new_inbox();
    let responder = Arc::clone(&bus);
    let _hb_sub = bus.subscribe(
        &hb_inbox,
        Arc::new(move |msg: BusMessage| {
            let responder = Arc::clone(&responder);
            Box::pin(async move {
                if let Some(reply) = msg.reply {
                    responder.publish(&reply, Vec::new());
                }
            })
        }),
    )?;
    let connect = ConnectRequest {
        client_id: "demo-client".to_string(),
        heartbeat_inbox: hb_inbox,
    };
    let resp = bus
        .request(&broker.info().discover, encode(&connect), Duration::from_secs(2))
        .await?;
    let info: ConnectResponse = decode(&resp.payload)?;
    if !info.error.is_empty() {
        return Err(info.error.into());
    }
    println!("connected: publishing via {}", info.pub_prefix);

    // subscribe to the demo channel
    let inbox = bus.new_inbox();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<MsgProto>();
    let _inbox_sub = bus.subscribe(
        &inbox,
        Arc::new(move |msg: BusMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Ok(frame) = decode::<MsgProto>(&msg.payload) {
                    let _ = tx.send(frame);
                }
            })
        }),
    )?;
    let sub = SubscriptionRequest {
        client_id: "demo-client".to_string(),
        channel: "demo".to_string(),
        inbox,
        max_in_flight: 64,
        ack_wait_secs: 30,
        ..SubscriptionRequest::default()
    };
    let resp = bus
        .request(&info.sub_requests, encode(&sub), Duration::from_secs(2))
        .await?;
    let sub_resp: SubscriptionResponse = decode(&resp.payload)?;
    if !sub_resp.error.is_empty() {
        return Err(sub_resp.error.into());
    }

    // publish and wait for the delivery
    let publish = PubMsg {
        client_id: "demo-client".to_string(),
        guid: Uuid::new_v4().simple().to_string(),
        channel: "demo".to_string(),
        payload: b"hello from the demo".to_vec(),
    };
    let resp = bus
        .request(
            &format!("{}.demo", info.pub_prefix),
            encode(&publish),
            Duration::from_secs(2),
        )
        .await?;
    let ack: PubAck = decode(&resp.payload)?;
    if !ack.error.is_empty() {
        return Err(ack.error.into());
    }

    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(msg)) => {
            println!(
                "received seq {} on {:?}: {}",
                msg.sequence,
                msg.channel,
                String::from_utf8_lossy(&msg.payload)
            );
            let ack = AckProto {
                channel: msg.channel,
                sequence: msg.sequence,
            };
            bus.publish(&sub_resp.ack_inbox, encode(&ack));
        }
        _ => return Err("no delivery within 2s".into()),
    }

    broker.shutdown();
    Ok(())
}
