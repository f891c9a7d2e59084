//! Peer invitations.
//!
//! Peers are bearer entries of the `peers` policy, each tagged with
//! `meta.peer = <name>`. The policy grants the `peer` authorization by default.

use std::collections::BTreeMap;

use rand::RngCore;

use crate::config::ConfigStore;
use crate::policy::types::{Bearer, Matcher, Policy};
use crate::policy::PolicyError;

pub const PEERS_POLICY: &str = "peers";
pub const PEER_AUTHORIZATION: &str = "peer";
const PEER_META_KEY: &str = "peer";

/// Issue a fresh token for `peer`, replacing any earlier one, and return it.
pub fn invite(store: &ConfigStore, peer: &str) -> Result<String, PolicyError> {
    if peer.is_empty() || peer.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(PolicyError::InvalidPeer(peer.to_string()));
    }

    let mut policy = match store.load_policy(PEERS_POLICY) {
        Ok(policy) => policy,
        Err(e) if e.is_not_found() => empty_peers_policy(),
        Err(e) => return Err(e.into()),
    };

    let token = new_token();
    let entries = policy.matcher.any.get_or_insert_with(Vec::new);
    entries.retain(|m| m.meta.get(PEER_META_KEY).map(String::as_str) != Some(peer));
    entries.push(Matcher {
        bearer: Some(vec![Bearer {
            token: Some(token.clone()),
            ..Default::default()
        }]),
        meta: BTreeMap::from([(PEER_META_KEY.to_string(), peer.to_string())]),
        ..Default::default()
    });

    store.save_policy(&policy)?;
    tracing::info!(peer = %peer, "Peer invited");
    Ok(token)
}

/// Names of invited peers, sorted.
pub fn list_peers(store: &ConfigStore) -> Result<Vec<String>, PolicyError> {
    let policy = match store.load_policy(PEERS_POLICY) {
        Ok(policy) => policy,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut peers: Vec<String> = policy
        .matcher
        .any
        .iter()
        .flatten()
        .filter_map(|m| m.meta.get(PEER_META_KEY).cloned())
        .collect();
    peers.sort();
    peers.dedup();
    Ok(peers)
}

fn empty_peers_policy() -> Policy {
    Policy {
        name: PEERS_POLICY.to_string(),
        matcher: Matcher {
            authorizations: Some(BTreeMap::from([(
                String::new(),
                PEER_AUTHORIZATION.to_string(),
            )])),
            any: Some(Vec::new()),
            ..Default::default()
        },
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
