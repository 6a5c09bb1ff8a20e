// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Caller-supplied callback slots the public command surface configures
//! through `reconfigure_options` (spec.md §6 `ReconfigureOptions` fields
//! ending in `_resolver`, plus `enqueue_download`).
//!
//! Browsing and user-metadata requests arriving from a peer are answered
//! from in-core state (spec.md §1: "browsing ... and file transfer" is
//! in scope), so [`BrowseResponseResolver`], [`UserInfoResolver`], and
//! [`PlaceInQueueResolver`] are invoked by `peer_manager` directly.
//! `search_response_resolver` and `directory_contents_resolver` back the
//! search/distributed-network overlay, which spec.md §1 explicitly
//! treats as an external collaborator: this module still declares their
//! shape so `reconfigure_options` can store and round-trip them, but no
//! part of this core invokes them.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{protocol::messages::peer::UserInfoResponse, transfer::state::Transfer};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Produces the raw bytes of a shared-directory listing to send back as a
/// `BrowseResponse` to `username`.
pub type BrowseResponseResolver = Arc<dyn Fn(String) -> BoxFuture<bytes::Bytes> + Send + Sync>;

/// Produces the `UserInfoResponse` to send back to `username`.
pub type UserInfoResolver = Arc<dyn Fn(String) -> BoxFuture<UserInfoResponse> + Send + Sync>;

/// Produces the queue position to report for `(username, filename)`.
pub type PlaceInQueueResolver = Arc<dyn Fn(String, String) -> BoxFuture<u32> + Send + Sync>;

/// Decides whether an unsolicited inbound download request should be
/// accepted immediately or queued first.
pub type EnqueueDownloadResolver = Arc<dyn Fn(Arc<Transfer>) -> BoxFuture<bool> + Send + Sync>;

/// Opaque search-result-aggregation hook; stored but never invoked by
/// this core (spec.md §1 Out of scope).
pub type SearchResponseResolver = Arc<dyn Fn(String) -> BoxFuture<()> + Send + Sync>;

/// Opaque shared-directory-listing hook for the distributed network
/// overlay; stored but never invoked by this core (spec.md §1 Out of
/// scope).
pub type DirectoryContentsResolver = Arc<dyn Fn(String) -> BoxFuture<()> + Send + Sync>;

/// The full set of resolver slots recognised by `reconfigure_options`
/// (spec.md §6). Each field is independently optional: a caller that
/// never configures `user_info_resolver`, say, gets no response sent back
/// to peers asking for it (the request is simply dropped with a warning).
#[derive(Clone, Default)]
pub struct ResolverSlots {
    pub search_response_resolver: Option<SearchResponseResolver>,
    pub browse_response_resolver: Option<BrowseResponseResolver>,
    pub directory_contents_resolver: Option<DirectoryContentsResolver>,
    pub user_info_resolver: Option<UserInfoResolver>,
    pub enqueue_download: Option<EnqueueDownloadResolver>,
    pub place_in_queue_resolver: Option<PlaceInQueueResolver>,
}
