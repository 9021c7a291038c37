//! Task auction demo
//!
//! Demonstrates:
//! - Contract Net Protocol bidding and award
//! - Team formation around the winner
//! - Workflow execution through an executor
//! - Result publication over the bus

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;
use troupe::message::to_payload;
use troupe::prelude::*;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let bus = MessageBus::new();
    let negotiation = NegotiationManager::new();
    let teams = TeamManager::new();

    // Register a small fleet.
    for (name, capabilities, workload) in [
        ("crawler", vec!["fetch", "parse"], 0.2),
        ("indexer", vec!["index", "parse"], 0.5),
        ("ranker", vec!["rank"], 0.1),
    ] {
        bus.register_agent(name);
        bus.subscribe(name, "progress");
        let capabilities: Vec<String> = capabilities.into_iter().map(String::from).collect();
        negotiation.register_capabilities(name, capabilities.clone());
        teams.register_agent(name, capabilities, workload);
    }

    // Auction the parsing work.
    let cfp = negotiation.create_cfp(
        "ranker",
        "parse the nightly crawl",
        vec!["parse".to_string()],
        None,
        30.0,
    );
    info!("eligible bidders: {:?}", negotiation.eligible_agents(&cfp.required_capabilities));

    negotiation.submit_bid(&cfp.id, "crawler", 20.0, 0.8, 5.0, Payload::new());
    negotiation.submit_bid(&cfp.id, "indexer", 35.0, 0.7, 8.0, Payload::new());
    let winner = negotiation.evaluate_bids(&cfp.id).expect("no winner");
    info!("auction won by {winner}");

    // Form a team around the required capability.
    let team = teams.create_team(
        "parse-crew",
        "parse the nightly crawl",
        vec!["parse".to_string()],
        2,
        Payload::new(),
    );
    info!(
        "team {} led by {:?} with capabilities {:?}",
        team.name,
        teams.team_leader(&team.id),
        teams.team_capabilities(&team.id),
    );

    // Run the work as a two-stage workflow; each task reports progress.
    let executor: Executor = {
        let bus = bus.clone();
        Arc::new(move |agent_name: String, params: Payload| {
            let bus = bus.clone();
            Box::pin(async move {
                let stage = params
                    .get("stage")
                    .and_then(Value::as_str)
                    .unwrap_or("work")
                    .to_string();
                tokio::time::sleep(Duration::from_millis(25)).await;
                bus.publish(
                    &agent_name,
                    "progress",
                    to_payload(json!({"stage": stage, "agent": agent_name})),
                );
                Ok(to_payload(json!({"stage": stage, "by": agent_name})))
            })
        })
    };

    let engine = WorkflowEngine::with_executor(executor);
    let workflow = engine.create_workflow("nightly-parse", "fetch then parse", Payload::new());
    let root = engine
        .add_node(&workflow.id, "pipeline", NodeKind::Sequence, None, Payload::new(), None)
        .expect("workflow exists");
    let fetch = engine
        .add_node(
            &workflow.id,
            "fetch",
            NodeKind::Task,
            Some("crawler".to_string()),
            to_payload(json!({"stage": "fetch"})),
            None,
        )
        .expect("workflow exists");
    let parse = engine
        .add_node(
            &workflow.id,
            "parse",
            NodeKind::Task,
            Some(winner.clone()),
            to_payload(json!({"stage": "parse"})),
            None,
        )
        .expect("workflow exists");
    engine.connect_nodes(&workflow.id, &root.id, &fetch.id);
    engine.connect_nodes(&workflow.id, &root.id, &parse.id);

    let result = engine.execute(&workflow.id, Payload::new()).await;
    info!(
        "workflow success={} in {:.0}ms, {} node results",
        result.success,
        result.total_duration.as_secs_f64() * 1000.0,
        result.node_results.len(),
    );

    negotiation.complete_negotiation(&cfp.id);

    // Drain one progress notification to show delivery.
    if let Some(update) = bus.receive("ranker", Some(Duration::from_secs(1))).await {
        info!("ranker saw progress: {:?}", update.content);
    }
}
