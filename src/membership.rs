//! Invite/join protocol establishing folder membership.
//!
//! A folder is created by minting two remote directories: the creator's
//! personal directory and the collective directory. The collective holds,
//! under each participant's nickname, the diminished readonly capability of
//! that participant's personal directory. An invite pre-provisions the
//! joiner's personal directory; the invite token hands its write capability
//! over together with the collective's readonly capability, and the inviter
//! forgets the write capability so that it is exclusively the joiner's.

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::caps::{CapKind, Capability, MalformedCapability, INVITE_SEPARATOR};
use crate::grid::{GridClient, GridError};
use crate::store::Store;

/// A participant's persistent configuration for one folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Root of the locally synchronized tree.
    pub local_root: PathBuf,
    /// Write capability of this participant's own personal directory.
    /// Exclusively owned; no other participant ever holds it.
    pub personal_write_cap: Capability,
    /// Readonly capability of the collective directory, shared by all
    /// participants.
    pub collective_read_cap: Capability,
    /// Write capability of the collective directory. Only the folder
    /// creator holds this; it is what lets them invite.
    pub collective_write_cap: Option<Capability>,
    /// Display name of this participant.
    pub nickname: String,
    /// Number of invites this participant has handed out.
    pub invites_sent: u32,
}

impl Membership {
    /// The diminished readonly capability of the own personal directory,
    /// i.e. the entry other participants see in the collective.
    pub fn personal_read_cap(&self) -> Result<Capability, MalformedCapability> {
        self.personal_write_cap.diminish()
    }
}

/// Membership lifecycle of a local folder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    /// No membership persisted yet.
    Unconfigured,
    /// Created by this participant, nobody invited yet.
    Created,
    /// Created by this participant, with the given number of invites handed
    /// out.
    Invited(u32),
    /// Joined via an invite token.
    Joined,
}

/// Derives the membership state from the persisted configuration.
pub fn folder_state(membership: Option<&Membership>) -> FolderState {
    match membership {
        None => FolderState::Unconfigured,
        Some(m) => match (m.collective_write_cap.is_some(), m.invites_sent) {
            (true, 0) => FolderState::Created,
            (true, n) => FolderState::Invited(n),
            (false, _) => FolderState::Joined,
        },
    }
}

/// The serialized pair of capabilities handed from inviter to joiner.
///
/// Wire form: the collective readonly capability and the joiner's personal
/// write capability, joined by [`INVITE_SEPARATOR`]. Parsing splits on the
/// last separator occurrence and validates both halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteToken {
    collective_read_cap: Capability,
    personal_write_cap: Capability,
}

impl InviteToken {
    /// Combines the two capabilities into a token.
    pub fn new(
        collective_read_cap: Capability,
        personal_write_cap: Capability,
    ) -> Result<Self, MalformedCapability> {
        if collective_read_cap.kind() != CapKind::DirRead
            || personal_write_cap.kind() != CapKind::DirWrite
        {
            return Err(MalformedCapability::InviteKinds);
        }
        Ok(InviteToken {
            collective_read_cap,
            personal_write_cap,
        })
    }

    /// The collective's readonly capability.
    pub fn collective_read_cap(&self) -> &Capability {
        &self.collective_read_cap
    }

    /// The joiner's personal write capability.
    pub fn personal_write_cap(&self) -> &Capability {
        &self.personal_write_cap
    }
}

impl fmt::Display for InviteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.collective_read_cap, INVITE_SEPARATOR, self.personal_write_cap
        )
    }
}

impl FromStr for InviteToken {
    type Err = MalformedCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (collective, personal) = s
            .rsplit_once(INVITE_SEPARATOR)
            .ok_or(MalformedCapability::MissingSeparator)?;
        InviteToken::new(collective.parse()?, personal.parse()?)
    }
}

/// Error creating a folder.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    /// This store already holds a membership.
    #[error("a folder is already configured for this store")]
    AlreadyConfigured,
    /// The grid rejected or could not serve an operation.
    #[error(transparent)]
    Grid(#[from] GridError),
    /// Capability handling failed.
    #[error(transparent)]
    Malformed(#[from] MalformedCapability),
    /// Local store failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Error minting an invite.
#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    /// No membership persisted yet.
    #[error("no folder configured")]
    Unconfigured,
    /// Only the creator holds the collective write capability.
    #[error("only the folder creator can invite")]
    NotCreator,
    /// The grid rejected or could not serve an operation.
    #[error(transparent)]
    Grid(#[from] GridError),
    /// Capability handling failed.
    #[error(transparent)]
    Malformed(#[from] MalformedCapability),
    /// Local store failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Error joining a folder.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// The invite token does not parse.
    #[error(transparent)]
    Malformed(#[from] MalformedCapability),
    /// A different membership is already configured for this store.
    #[error("already joined a folder with a different invite or local path")]
    AlreadyJoined,
    /// Local store failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Creates a fresh folder: mints the personal and collective directories,
/// links the creator's diminished capability into the collective under
/// `nickname`, and persists the resulting membership.
pub async fn create(
    grid: &dyn GridClient,
    store: &Store,
    nickname: &str,
    local_root: PathBuf,
) -> Result<Membership, CreateError> {
    if store.membership()?.is_some() {
        return Err(CreateError::AlreadyConfigured);
    }

    let personal_write_cap = grid.create_directory().await?;
    let collective_write_cap = grid.create_directory().await?;
    let collective_read_cap = collective_write_cap.diminish()?;

    let personal_read_cap = personal_write_cap.diminish()?;
    grid.link(&collective_write_cap, nickname, &personal_read_cap)
        .await?;

    let membership = Membership {
        local_root,
        personal_write_cap,
        collective_read_cap,
        collective_write_cap: Some(collective_write_cap),
        nickname: nickname.to_string(),
        invites_sent: 0,
    };
    store.set_membership(&membership)?;
    info!(
        nickname,
        collective = %collective_read_cap.fmt_short(),
        "created folder"
    );
    Ok(membership)
}

/// Mints an invite for `nickname`.
///
/// Pre-provisions the joiner's personal directory, links its diminished
/// capability into the collective, and returns the token. The freshly
/// minted write capability lives only inside the returned token; this
/// participant does not keep a copy, so it ends up exclusively the
/// joiner's.
pub async fn invite(
    grid: &dyn GridClient,
    store: &Store,
    nickname: &str,
) -> Result<InviteToken, InviteError> {
    let mut membership = store.membership()?.ok_or(InviteError::Unconfigured)?;
    let collective_write_cap = membership
        .collective_write_cap
        .ok_or(InviteError::NotCreator)?;

    let personal_write_cap = grid.create_directory().await?;
    let personal_read_cap = personal_write_cap.diminish()?;
    grid.link(&collective_write_cap, nickname, &personal_read_cap)
        .await?;

    membership.invites_sent += 1;
    store.set_membership(&membership)?;

    debug!(nickname, "minted invite");
    Ok(InviteToken::new(
        membership.collective_read_cap,
        personal_write_cap,
    )?)
}

/// Consumes an invite token and persists the joiner's membership.
///
/// Idempotent: joining again with the same token and local path is a no-op
/// success. Joining with a different token or path while already configured
/// fails with [`JoinError::AlreadyJoined`].
pub fn join(
    store: &Store,
    token: &InviteToken,
    local_root: PathBuf,
    nickname: &str,
) -> Result<Membership, JoinError> {
    if let Some(existing) = store.membership()? {
        let same = existing.collective_read_cap == token.collective_read_cap
            && existing.personal_write_cap == token.personal_write_cap
            && existing.local_root == local_root;
        if same {
            debug!(nickname, "join repeated with identical token, no-op");
            return Ok(existing);
        }
        return Err(JoinError::AlreadyJoined);
    }

    let membership = Membership {
        local_root,
        personal_write_cap: token.personal_write_cap,
        collective_read_cap: token.collective_read_cap,
        collective_write_cap: None,
        nickname: nickname.to_string(),
        invites_sent: 0,
    };
    store.set_membership(&membership)?;
    info!(nickname, "joined folder");
    Ok(membership)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MemGrid;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("ledger.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_links_own_readonly_cap_into_collective() {
        let grid = MemGrid::new();
        let (_dir, store) = temp_store();
        let m = create(&grid, &store, "alice", "/tmp/alice".into())
            .await
            .unwrap();

        let entries = grid.list(&m.collective_read_cap).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "alice");
        assert_eq!(entries[0].cap, m.personal_read_cap().unwrap());
        assert_eq!(folder_state(Some(&m)), FolderState::Created);
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let grid = MemGrid::new();
        let (_dir, store) = temp_store();
        create(&grid, &store, "alice", "/tmp/alice".into())
            .await
            .unwrap();
        let err = create(&grid, &store, "alice", "/tmp/alice".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateError::AlreadyConfigured));
    }

    #[tokio::test]
    async fn invite_and_join() {
        let grid = MemGrid::new();
        let (_a, alice_store) = temp_store();
        let (_b, bob_store) = temp_store();

        let alice = create(&grid, &alice_store, "alice", "/tmp/alice".into())
            .await
            .unwrap();
        let token = invite(&grid, &alice_store, "bob").await.unwrap();

        // token survives its wire form
        let token: InviteToken = token.to_string().parse().unwrap();
        let bob = join(&bob_store, &token, "/tmp/bob".into(), "bob").unwrap();

        assert_eq!(bob.collective_read_cap, alice.collective_read_cap);
        assert_ne!(bob.personal_write_cap, alice.personal_write_cap);
        assert_eq!(folder_state(Some(&bob)), FolderState::Joined);

        // collective now lists both participants' diminished caps
        let entries = grid.list(&alice.collective_read_cap).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "alice");
        assert_eq!(entries[1].name, "bob");
        assert_eq!(entries[1].cap, bob.personal_read_cap().unwrap());

        let alice_after = alice_store.membership().unwrap().unwrap();
        assert_eq!(folder_state(Some(&alice_after)), FolderState::Invited(1));
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let grid = MemGrid::new();
        let (_a, alice_store) = temp_store();
        let (_b, bob_store) = temp_store();

        create(&grid, &alice_store, "alice", "/tmp/alice".into())
            .await
            .unwrap();
        let token = invite(&grid, &alice_store, "bob").await.unwrap();

        let first = join(&bob_store, &token, "/tmp/bob".into(), "bob").unwrap();
        let second = join(&bob_store, &token, "/tmp/bob".into(), "bob").unwrap();
        assert_eq!(first, second);

        // a different token for the same store is refused
        let other = invite(&grid, &alice_store, "carol").await.unwrap();
        let err = join(&bob_store, &other, "/tmp/bob".into(), "bob").unwrap_err();
        assert!(matches!(err, JoinError::AlreadyJoined));
    }

    #[test]
    fn token_parse_failures() {
        assert_eq!(
            "garbage".parse::<InviteToken>().unwrap_err(),
            MalformedCapability::MissingSeparator
        );
        let read = Capability::from_parts(CapKind::DirRead, [1; 32]);
        let write = Capability::from_parts(CapKind::DirWrite, [2; 32]);
        // halves swapped
        let swapped = format!("{write}{INVITE_SEPARATOR}{read}");
        assert_eq!(
            swapped.parse::<InviteToken>().unwrap_err(),
            MalformedCapability::InviteKinds
        );
        // well-formed token parses
        let ok = format!("{read}{INVITE_SEPARATOR}{write}");
        let token = ok.parse::<InviteToken>().unwrap();
        assert_eq!(*token.collective_read_cap(), read);
        assert_eq!(*token.personal_write_cap(), write);
    }

    #[tokio::test]
    async fn only_creator_can_invite() {
        let grid = MemGrid::new();
        let (_a, alice_store) = temp_store();
        let (_b, bob_store) = temp_store();

        create(&grid, &alice_store, "alice", "/tmp/alice".into())
            .await
            .unwrap();
        let token = invite(&grid, &alice_store, "bob").await.unwrap();
        join(&bob_store, &token, "/tmp/bob".into(), "bob").unwrap();

        let err = invite(&grid, &bob_store, "mallory").await.unwrap_err();
        assert!(matches!(err, InviteError::NotCreator));
    }
}
