use anyhow::{anyhow, Result};
use msb::adapter::memory::{InMemoryAdapterFactory, InMemoryBroker};
use msb::message::MessageTemplate;
use msb::{
    ConversationEnd, MsbConfig, MsbContext, MsbContextBuilder, RequestOptions, ResponderContext,
    ResponderServer,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::sync::mpsc::unbounded_channel;
use tracing::info;

#[derive(Debug, StructOpt)]
#[structopt(about = "Sends pings to a set of pong services over an in-process broker")]
struct Options {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(short, long, default_value = "info", env = "RUST_LOG", value_name = "level")]
    log: String,

    /// Use a condensed log format
    #[structopt(long)]
    compact: bool,

    /// Topic the pings are sent to
    #[structopt(long, default_value = "pingpong:namespace", value_name = "topic")]
    namespace: String,

    /// Number of pong services answering each ping
    #[structopt(long, default_value = "3", value_name = "count")]
    responders: usize,

    /// Number of pings to send
    #[structopt(long, default_value = "2", value_name = "count")]
    rounds: usize,

    #[structopt(flatten)]
    msb: MsbConfig,
}

#[derive(Serialize, Deserialize, Debug)]
struct Ping {
    round: usize,
}

#[derive(Serialize, Deserialize, Debug)]
struct Pong {
    round: usize,
    responder: usize,
}

fn context(broker: &Arc<InMemoryBroker>, config: MsbConfig) -> Result<MsbContext> {
    let factory = InMemoryAdapterFactory::new(broker.clone(), config.broker.clone());

    Ok(MsbContextBuilder::new()
        .with_config(config)
        .with_adapter_factory(Arc::new(factory))
        .build()?)
}

async fn pong_service(
    context: &MsbContext,
    namespace: &str,
    responder: usize,
) -> Result<ResponderServer<Ping>> {
    let server = context.create_responder_server(
        namespace,
        MessageTemplate::new().with_tags(vec!["pong"]),
        move |ping: Ping, context: ResponderContext| async move {
            let responder_handle = context.responder();
            responder_handle.send_ack(Some(500), None).await?;
            responder_handle
                .send(&Pong {
                    round: ping.round,
                    responder,
                })
                .await?;

            Ok::<(), msb::BoxedError>(())
        },
    )?;

    server.listen().await?;
    Ok(server)
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::from_args();

    let formatter = tracing_subscriber::fmt().with_env_filter(options.log.as_str());
    if options.compact {
        formatter.compact().init();
    } else {
        formatter.init();
    }

    let broker = InMemoryBroker::new();
    let mut pong_contexts = Vec::with_capacity(options.responders);
    let mut servers = Vec::with_capacity(options.responders);

    for responder in 0..options.responders {
        let config = MsbConfig {
            service_name: "pong".into(),
            instance_id: None,
            ..options.msb.clone()
        };

        let context = context(&broker, config)?;
        servers.push(pong_service(&context, &options.namespace, responder).await?);
        pong_contexts.push(context);
    }

    let ping_context = context(&broker, options.msb.clone())?;
    let (ends_tx, mut ends_rx) = unbounded_channel::<ConversationEnd>();

    let requester = ping_context
        .create_requester::<Pong>(
            &options.namespace,
            RequestOptions::new()
                .with_wait_for_responses(options.responders as i32)
                .with_response_timeout(options.msb.default_response_timeout())
                .with_message_template(MessageTemplate::new().with_tags(vec!["ping"])),
        )?
        .on_response(|pong: Pong| println!("round {} pong from responder {}", pong.round, pong.responder))
        .on_end(move |end: ConversationEnd| {
            ends_tx.send(end).ok();
        });

    for round in 0..options.rounds {
        let correlation_id = requester.publish(&Ping { round }).await?;
        info!(round, correlation_id = %correlation_id, "Sent ping");

        let timeout = options.msb.default_response_timeout() + Duration::from_secs(1);
        let end = tokio::time::timeout(timeout, ends_rx.recv())
            .await?
            .ok_or_else(|| anyhow!("conversation callbacks were dropped"))?;

        println!(
            "round {} ended ({}): {} responses, acknowledged by {} responders",
            round,
            end.reason,
            end.responses_received,
            end.acknowledged_by.len()
        );
    }

    ping_context.shutdown().await;
    for context in &pong_contexts {
        context.shutdown().await;
    }
    drop(servers);

    Ok(())
}
