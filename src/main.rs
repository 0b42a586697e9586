//! BitChat Mesh demo
//!
//! Builds a small simulated mesh, lets it converge, exchanges direct and
//! broadcast messages and prints the resulting network status. Set
//! `RUST_LOG=debug` to follow every forwarding decision.

use anyhow::{Context, Result};
use log::info;
use std::time::Duration;

use bitchat_mesh::{Destination, MeshConfig, MeshCoordinator, PeerId, SimulatedNetwork};

/// Time allowed for route advertisements to settle
const CONVERGENCE_WAIT: Duration = Duration::from_secs(6);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    info!("=== BitChat Mesh: simulated network ===");

    let network = SimulatedNetwork::new();
    let names = ["alice", "bob", "charlie"];
    let mut nodes = Vec::new();
    for name in names {
        let link = network
            .attach(name)
            .with_context(|| format!("Invalid node id {}", name))?;
        let node = MeshCoordinator::new(link, MeshConfig::default())
            .with_context(|| format!("Failed to create node {}", name))?;
        let owner = name.to_string();
        node.on_message_delivered(move |message| match message.text_content() {
            Some(text) => println!("[{}] {} says: {}", owner, message.sender, text),
            None => println!("[{}] notice: {:?}", owner, message.system_notice()),
        });
        nodes.push(node);
    }

    // alice <-> bob <-> charlie; alice and charlie are out of range
    network.connect(&PeerId::from("alice"), &PeerId::from("bob"));
    network.connect(&PeerId::from("bob"), &PeerId::from("charlie"));

    println!("1. Connecting nodes...");
    for node in &nodes {
        node.connect().await?;
    }
    tokio::time::sleep(CONVERGENCE_WAIT).await;

    println!("\n2. Routing tables:");
    for node in &nodes {
        for route in node.routes() {
            println!(
                "  {} -> {}: next hop {}, cost {}",
                node.local_id(),
                route.destination,
                route.next_hop,
                route.cost
            );
        }
    }

    let (alice, charlie) = (&nodes[0], &nodes[2]);

    println!("\n3. Direct message over two hops...");
    let id = alice.send_text(PeerId::from("charlie"), "Hello Charlie!").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("  {} pending acknowledgments after {}", alice.pending_acknowledgments(), id);

    println!("\n4. Broadcast...");
    charlie.send_text(Destination::Broadcast, "Hello everyone!").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n5. Network status:");
    let status = alice.get_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    println!("\n6. Charlie leaves...");
    charlie.disconnect().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for peer in alice.list_peers() {
        println!("  {} ({:?})", peer.id, peer.status);
    }

    for node in &nodes {
        node.disconnect().await?;
    }
    info!("Demo finished");
    Ok(())
}
