//! Per-peer pause token bookkeeping and peer id canonicalization

use std::collections::{BTreeSet, HashMap};

use crate::net::protocol::PeerId;
use crate::util::time::unix_millis;

/// Which side of the protocol a token arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOp {
    Pause,
    Resume,
}

/// Outcome of checking a token against a peer's history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVerdict {
    Accept,
    /// Older than what was already applied
    Stale { token: u64, floor: u64 },
    /// Untokenized message from a peer that has sent tokens before
    Downgrade,
}

/// Token state of one canonical peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseTokenEntry {
    pub canonical_id: PeerId,
    /// Highest token applied in either direction
    pub latest_token: Option<u64>,
    /// Token of the pause currently in force
    pub active_token: Option<u64>,
    /// Set once the peer sends any token; never cleared
    pub supports_tokens: bool,
    /// Token of the last applied resume
    pub last_resolved_token: Option<u64>,
}

impl PauseTokenEntry {
    pub fn new(canonical_id: PeerId) -> Self {
        Self {
            canonical_id,
            latest_token: None,
            active_token: None,
            supports_tokens: false,
            last_resolved_token: None,
        }
    }

    pub fn check(&self, token: Option<u64>, op: TokenOp) -> TokenVerdict {
        let Some(token) = token else {
            return if self.supports_tokens {
                TokenVerdict::Downgrade
            } else {
                TokenVerdict::Accept
            };
        };

        if let Some(latest) = self.latest_token {
            if token < latest {
                return TokenVerdict::Stale { token, floor: latest };
            }
        }

        match op {
            // A pause carrying an already-resolved token is a late duplicate
            TokenOp::Pause => match self.last_resolved_token {
                Some(resolved) if token <= resolved => TokenVerdict::Stale {
                    token,
                    floor: resolved,
                },
                _ => TokenVerdict::Accept,
            },
            TokenOp::Resume => match self.active_token {
                Some(active) if token < active => TokenVerdict::Stale {
                    token,
                    floor: active,
                },
                _ => TokenVerdict::Accept,
            },
        }
    }

    pub fn apply(&mut self, token: Option<u64>, op: TokenOp) {
        if let Some(token) = token {
            self.supports_tokens = true;
            self.latest_token = Some(self.latest_token.map_or(token, |l| l.max(token)));
        }
        match op {
            TokenOp::Pause => self.active_token = token,
            TokenOp::Resume => {
                self.active_token = None;
                if token.is_some() {
                    self.last_resolved_token = token;
                }
            }
        }
    }

    /// Fold in the history of an id that turned out to be an alias of this peer
    fn absorb(&mut self, other: PauseTokenEntry) {
        self.supports_tokens |= other.supports_tokens;
        self.latest_token = max_opt(self.latest_token, other.latest_token);
        self.last_resolved_token = max_opt(self.last_resolved_token, other.last_resolved_token);
        self.active_token = max_opt(self.active_token, other.active_token)
            .filter(|active| Some(*active) > self.last_resolved_token);
    }
}

fn max_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Bidirectional map between canonical peer ids and their aliases
#[derive(Debug, Default)]
pub struct AliasMap {
    alias_of: HashMap<PeerId, PeerId>,
    members: HashMap<PeerId, BTreeSet<PeerId>>,
}

impl AliasMap {
    pub fn canonical(&self, id: &PeerId) -> PeerId {
        self.alias_of.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    /// Register `id` (or its canonical) as known
    pub fn touch(&mut self, id: &PeerId) -> PeerId {
        let canonical = self.canonical(id);
        self.members.entry(canonical.clone()).or_default();
        canonical
    }

    /// Link two ids of the same peer. Returns the canonical id and, when two
    /// previously separate canonical ids collapsed, the one that was demoted.
    pub fn link(&mut self, public_id: &PeerId, private_id: &PeerId) -> (PeerId, Option<PeerId>) {
        let cp = self.canonical(public_id);
        let cq = self.canonical(private_id);
        if cp == cq {
            self.members.entry(cp.clone()).or_default();
            return (cp, None);
        }

        let (winner, loser) = if !self.members.contains_key(&cp) && self.members.contains_key(&cq) {
            (cq, cp)
        } else {
            (cp, cq)
        };

        let demoted = self.members.remove(&loser);
        let merged = demoted.as_ref().map(|_| loser.clone());
        let moved: Vec<PeerId> = demoted
            .unwrap_or_default()
            .into_iter()
            .chain(std::iter::once(loser))
            .collect();

        let members = self.members.entry(winner.clone()).or_default();
        for alias in moved {
            self.alias_of.insert(alias.clone(), winner.clone());
            members.insert(alias);
        }
        (winner, merged)
    }

    /// Number of canonical peers
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn aliases(&self, canonical: &PeerId) -> impl Iterator<Item = &PeerId> {
        self.members.get(canonical).into_iter().flatten()
    }

    pub fn clear(&mut self) {
        self.alias_of.clear();
        self.members.clear();
    }
}

/// Result of canonicalizing a peer reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub canonical: PeerId,
    /// Former canonical id folded into `canonical`
    pub merged: Option<PeerId>,
}

/// Token entries for every peer referenced this session
#[derive(Debug, Default)]
pub struct PauseTokenStore {
    entries: HashMap<PeerId, PauseTokenEntry>,
    aliases: AliasMap,
}

impl PauseTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize a peer reference, linking `private_id` as an alias when given
    pub fn resolve_id(&mut self, public_id: &PeerId, private_id: Option<&PeerId>) -> Resolved {
        let (canonical, merged) = match private_id {
            Some(private_id) if private_id != public_id => self.aliases.link(public_id, private_id),
            _ => (self.aliases.touch(public_id), None),
        };

        if let Some(old) = merged.as_ref().and_then(|loser| self.entries.remove(loser)) {
            self.entry_mut(&canonical).absorb(old);
        }

        Resolved { canonical, merged }
    }

    /// Canonical id without registering anything
    pub fn canonical(&self, id: &PeerId) -> PeerId {
        self.aliases.canonical(id)
    }

    pub fn entry(&self, canonical: &PeerId) -> Option<&PauseTokenEntry> {
        self.entries.get(canonical)
    }

    pub fn entry_mut(&mut self, canonical: &PeerId) -> &mut PauseTokenEntry {
        self.entries
            .entry(canonical.clone())
            .or_insert_with(|| PauseTokenEntry::new(canonical.clone()))
    }

    pub fn aliases(&self) -> &AliasMap {
        &self.aliases
    }

    /// Number of distinct peers seen, whether or not they sent a token yet
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Forget every peer (teardown / resync)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.aliases.clear();
    }
}

/// Mints strictly increasing tokens for the local peer.
///
/// Seeded from the wall clock so a reloaded peer keeps outranking the tokens
/// of its previous incarnation.
#[derive(Debug, Clone)]
pub struct TokenMinter {
    last: u64,
}

impl TokenMinter {
    pub fn new() -> Self {
        Self::starting_at(unix_millis())
    }

    pub fn starting_at(seed: u64) -> Self {
        Self { last: seed }
    }

    pub fn mint(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

impl Default for TokenMinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    #[test]
    fn untokenized_peer_is_accepted_until_it_sends_a_token() {
        let mut entry = PauseTokenEntry::new(peer("a"));
        assert_eq!(entry.check(None, TokenOp::Pause), TokenVerdict::Accept);
        entry.apply(None, TokenOp::Pause);
        assert_eq!(entry.check(Some(4), TokenOp::Resume), TokenVerdict::Accept);
        entry.apply(Some(4), TokenOp::Resume);
        assert_eq!(entry.check(None, TokenOp::Pause), TokenVerdict::Downgrade);
        assert_eq!(entry.check(None, TokenOp::Resume), TokenVerdict::Downgrade);
    }

    #[test]
    fn resolved_token_cannot_pause_again() {
        let mut entry = PauseTokenEntry::new(peer("a"));
        entry.apply(Some(5), TokenOp::Pause);
        entry.apply(Some(5), TokenOp::Resume);
        assert_eq!(
            entry.check(Some(5), TokenOp::Pause),
            TokenVerdict::Stale { token: 5, floor: 5 }
        );
        assert_eq!(entry.check(Some(6), TokenOp::Pause), TokenVerdict::Accept);
    }

    #[test]
    fn alias_links_in_both_directions() {
        let mut store = PauseTokenStore::new();
        let first = store.resolve_id(&peer("pub-1"), None);
        assert_eq!(first.canonical, peer("pub-1"));

        let linked = store.resolve_id(&peer("pub-1"), Some(&peer("priv-1")));
        assert_eq!(linked.canonical, peer("pub-1"));
        assert_eq!(store.canonical(&peer("priv-1")), peer("pub-1"));
        assert_eq!(
            store.resolve_id(&peer("priv-1"), None).canonical,
            peer("pub-1")
        );
        let aliases: Vec<_> = store.aliases().aliases(&peer("pub-1")).cloned().collect();
        assert_eq!(aliases, vec![peer("priv-1")]);
    }

    #[test]
    fn late_link_merges_token_history() {
        let mut store = PauseTokenStore::new();
        let a = store.resolve_id(&peer("pub"), None).canonical;
        store.entry_mut(&a).apply(Some(3), TokenOp::Pause);
        let b = store.resolve_id(&peer("priv"), None).canonical;
        store.entry_mut(&b).apply(Some(9), TokenOp::Pause);

        let resolved = store.resolve_id(&peer("pub"), Some(&peer("priv")));
        assert_eq!(resolved.canonical, peer("pub"));
        assert_eq!(resolved.merged, Some(peer("priv")));
        assert_eq!(store.len(), 1);
        assert!(store.entry(&peer("priv")).is_none());
        let entry = store.entry(&peer("pub")).expect("entry");
        assert_eq!(entry.latest_token, Some(9));
        assert_eq!(entry.active_token, Some(9));
        assert!(entry.supports_tokens);
    }

    #[test]
    fn minted_tokens_increase() {
        let mut minter = TokenMinter::starting_at(100);
        assert_eq!(minter.mint(), 101);
        assert_eq!(minter.mint(), 102);
        assert!(TokenMinter::new().last() > 1_600_000_000_000);
    }
}
