//! Proptest generators for property-based testing.

use proptest::prelude::*;

use streamsync_core::{Confirmation, MembershipOp, StreamId, StreamKind, SyncCookie, UserId};

/// A user drawn from a pool of `pool` addresses, so sequences collide.
pub fn user_id(pool: u8) -> impl Strategy<Value = UserId> {
    (0..pool.max(1)).prop_map(|n| UserId::from_bytes([n; 20]))
}

pub fn stream_kind() -> impl Strategy<Value = StreamKind> {
    prop_oneof![
        Just(StreamKind::Channel),
        Just(StreamKind::Dm),
        Just(StreamKind::Gdm),
        Just(StreamKind::Media),
        Just(StreamKind::Space),
        Just(StreamKind::User),
        Just(StreamKind::UserDevice),
        Just(StreamKind::UserInbox),
        Just(StreamKind::UserSettings),
    ]
}

/// A stream id of any known kind.
pub fn stream_id() -> impl Strategy<Value = StreamId> {
    (stream_kind(), any::<[u8; 20]>())
        .prop_map(|(kind, bytes)| StreamId::for_user(kind, &UserId::from_bytes(bytes)))
}

pub fn sync_cookie() -> impl Strategy<Value = SyncCookie> {
    (stream_id(), 0u64..10_000, 0u64..16)
        .prop_map(|(id, mb, gen)| SyncCookie::new(id, mb).with_minipool_gen(gen))
}

pub fn membership_op() -> impl Strategy<Value = MembershipOp> {
    prop_oneof![
        1 => Just(MembershipOp::Unspecified),
        3 => Just(MembershipOp::Invite),
        3 => Just(MembershipOp::Join),
        3 => Just(MembershipOp::Leave),
    ]
}

pub fn confirmation() -> impl Strategy<Value = Confirmation> {
    prop_oneof![Just(Confirmation::Pending), Just(Confirmation::Confirmed)]
}

/// One membership event as a reconciler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipStep {
    pub user: UserId,
    pub op: MembershipOp,
    pub confirmation: Confirmation,
}

pub fn membership_step(pool: u8) -> impl Strategy<Value = MembershipStep> {
    (user_id(pool), membership_op(), confirmation()).prop_map(|(user, op, confirmation)| {
        MembershipStep {
            user,
            op,
            confirmation,
        }
    })
}

/// Up to `max_len` steps over a pool of `pool` users.
pub fn membership_steps(pool: u8, max_len: usize) -> impl Strategy<Value = Vec<MembershipStep>> {
    prop::collection::vec(membership_step(pool), 0..=max_len)
}
