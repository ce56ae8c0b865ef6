mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use wallet_bridge::config::{Config, DEFAULT_NAMESPACE};
use wallet_bridge::domains::envelope::{Channel, ContextName, Envelope, EnvelopeKind};
use wallet_bridge::domains::rpc::{RpcRequest, PROVIDER_REQUEST};
use wallet_bridge::interfaces::wallet::AutoApproval;
use wallet_bridge::services::window::{WindowBody, WindowMessage};

use common::ScriptedWallet;

fn page_request(id: u64, from: &str, method: &str) -> Envelope {
    let payload = serde_json::to_value(RpcRequest::new(id, method, Value::Null)).unwrap();
    Envelope::request(Channel::BACKGROUND_INPAGE, id, from, PROVIDER_REQUEST, payload)
}

fn window_value(origin: ContextName, envelope: Envelope) -> Value {
    WindowMessage::envelope(DEFAULT_NAMESPACE, origin, envelope)
        .to_value()
        .unwrap()
}

/// Drains whatever reached the window within `quiet`.
async fn drain(rx: &mut UnboundedReceiver<Value>, quiet: Duration) -> Vec<Value> {
    let mut seen = Vec::new();
    while let Ok(Some(message)) = tokio::time::timeout(quiet, rx.recv()).await {
        seen.push(message);
    }
    seen
}

fn responses_to(messages: &[Value], instance: &str) -> Vec<Envelope> {
    messages
        .iter()
        .filter_map(|raw| WindowMessage::parse(raw, DEFAULT_NAMESPACE))
        .filter(|message| message.origin == ContextName::ContentScript)
        .filter_map(|message| match message.body {
            WindowBody::Envelope { envelope } => Some(envelope),
            WindowBody::PortClosed => None,
        })
        .filter(|envelope| {
            envelope.kind == EnvelopeKind::Response && envelope.to.as_deref() == Some(instance)
        })
        .collect()
}

#[tokio::test]
async fn forged_and_out_of_scope_page_messages_are_dropped() {
    let wallet = Arc::new(ScriptedWallet::new(Vec::new()));
    let runtime = common::runtime(
        Config::default(),
        wallet.clone(),
        Arc::new(AutoApproval::allow()),
    )
    .await;
    let tab = runtime.open_tab();
    let window = tab.window().clone();

    // Page script claiming to be the background.
    window.post_message(window_value(
        ContextName::Background,
        page_request(1, "evil", "eth_blockNumber"),
    ));
    // Channel the page may not address.
    window.post_message(window_value(
        ContextName::Inpage,
        Envelope::request(Channel::BACKGROUND_CONTENT_SCRIPT, 2, "evil", "ping", Value::Null),
    ));
    // Page trying to tear the port down for other scripts.
    window.post_message(
        WindowMessage::port_closed(DEFAULT_NAMESPACE, ContextName::Inpage)
            .to_value()
            .unwrap(),
    );
    window.post_message(json!({
        "namespace": DEFAULT_NAMESPACE,
        "origin": "inpage",
        "body": {"type": "bogus"}
    }));
    // Other namespaces are not ours to judge.
    window.post_message(json!({"namespace": "someone-else", "origin": "inpage"}));

    let bridge_stats = || tab.bridge().stats().snapshot();
    assert!(common::wait_until(|| bridge_stats().2 == 4).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let (to_extension, _, rejected, _) = bridge_stats();
    assert_eq!(to_extension, 0);
    assert_eq!(rejected, 4);
    assert_eq!(wallet.call_count(), 0);
}

#[tokio::test]
async fn replayed_page_envelope_is_relayed_once() {
    let wallet = Arc::new(ScriptedWallet::new(Vec::new()));
    let runtime = common::runtime(
        Config::default(),
        wallet.clone(),
        Arc::new(AutoApproval::allow()),
    )
    .await;
    let tab = runtime.open_tab();
    let mut observer = tab.window().add_listener();

    let raw = window_value(ContextName::Inpage, page_request(7, "inpage-manual", "eth_blockNumber"));
    tab.window().post_message(raw.clone());
    tab.window().post_message(raw);

    let seen = drain(&mut observer, Duration::from_millis(150)).await;
    let responses = responses_to(&seen, "inpage-manual");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].payload, json!("0x10"));
    assert_eq!(wallet.call_count(), 1);

    let (to_extension, to_page, _, duplicates) = tab.bridge().stats().snapshot();
    assert_eq!((to_extension, to_page, duplicates), (1, 1, 1));
}

#[tokio::test]
async fn same_id_from_distinct_senders_is_not_a_duplicate() {
    let wallet = Arc::new(ScriptedWallet::new(Vec::new()));
    let runtime = common::runtime(
        Config::default(),
        wallet.clone(),
        Arc::new(AutoApproval::allow()),
    )
    .await;
    let tab = runtime.open_tab();
    let mut observer = tab.window().add_listener();

    for sender in ["inpage-a", "inpage-b"] {
        tab.window().post_message(window_value(
            ContextName::Inpage,
            page_request(1, sender, "eth_chainId"),
        ));
    }

    let seen = drain(&mut observer, Duration::from_millis(150)).await;
    assert_eq!(responses_to(&seen, "inpage-a").len(), 1);
    assert_eq!(responses_to(&seen, "inpage-b").len(), 1);
    assert_eq!(tab.bridge().stats().snapshot().3, 0);
}

#[tokio::test]
async fn extension_identity_never_reaches_the_page() {
    let runtime = common::runtime(
        Config::default(),
        Arc::new(ScriptedWallet::new(Vec::new())),
        Arc::new(AutoApproval::allow()),
    )
    .await;
    let identity = runtime.identity().get().await.unwrap();
    let tab = runtime.open_tab();
    let mut observer = tab.window().add_listener();
    let provider = tab.inject_provider();

    provider.chain_id().await.unwrap();
    provider.request_accounts().await.unwrap();
    runtime.pipeline().set_chain_id(137).await;

    let seen = drain(&mut observer, Duration::from_millis(150)).await;
    assert!(!seen.is_empty());
    for message in &seen {
        assert!(
            !message.to_string().contains(identity.as_str()),
            "identity leaked: {message}"
        );
    }

    let relayed: Vec<Envelope> = seen
        .iter()
        .filter_map(|raw| WindowMessage::parse(raw, DEFAULT_NAMESPACE))
        .filter(|message| message.origin == ContextName::ContentScript)
        .filter_map(|message| match message.body {
            WindowBody::Envelope { envelope } => Some(envelope),
            WindowBody::PortClosed => None,
        })
        .collect();
    assert!(relayed.iter().any(|envelope| envelope.kind == EnvelopeKind::Event));
    for envelope in &relayed {
        let meta = envelope.meta.as_ref().unwrap();
        assert_eq!(meta.context, ContextName::Background);
        assert_eq!(meta.tab_id, Some(tab.id()));
        assert!(meta.identity.is_none());
        assert!(meta.relay_seq.is_some());
    }

    // The bridge never relays its own posts back to the extension.
    let (to_extension, _, rejected, duplicates) = tab.bridge().stats().snapshot();
    assert_eq!((to_extension, rejected, duplicates), (2, 0, 0));
}

#[tokio::test]
async fn ping_reaches_background() {
    let runtime = common::runtime(
        Config::default(),
        Arc::new(ScriptedWallet::new(Vec::new())),
        Arc::new(AutoApproval::allow()),
    )
    .await;
    let tab = runtime.open_tab();
    assert_eq!(tab.bridge().ping().await.unwrap(), json!("pong"));
    assert_eq!(tab.bridge().tab_id(), tab.id());
}
