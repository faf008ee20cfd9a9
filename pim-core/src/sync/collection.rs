//! Reconciles a resource's remote collection listing against the local
//! tree: matches nodes by remote id (flat) or by remote ancestor chain
//! (hierarchical), creates/modifies/moves what changed, and deletes
//! what's gone, all inside one server-side transaction.

use std::collections::HashMap;
use std::sync::Arc;

use pim_contracts::collection::Collection;
use pim_contracts::error::ContractError;
use pim_contracts::id::{EntityId, RemoteId, ResourceId, ROOT_ID};
use pim_contracts::scope::{EntityScope, FetchDepth, ListFilter};

use crate::channel::{Command, CommandChannel, Response};
use crate::error::{Result, SyncError};
use crate::sync::{Progress, SyncMode};

/// One remote listing entry. `collection.parent` is the already-resolved
/// local parent id when `hierarchical_rids` is false; it's ignored (and
/// may be left as [`pim_contracts::id::INVALID_ID`]) when true, in
/// which case `remote_ancestor_chain` carries the remote-id path from
/// this node's parent up toward the root (nearest first).
#[derive(Clone, Debug)]
pub struct RemoteCollection {
    pub collection: Collection,
    pub remote_ancestor_chain: Vec<RemoteId>,
}

struct LocalNode {
    collection: Collection,
    processed: bool,
}

pub struct CollectionSync {
    channel: Arc<dyn CommandChannel>,
    resource: ResourceId,
    mode: SyncMode,
    hierarchical_rids: bool,
    streaming: bool,
    nodes: HashMap<EntityId, LocalNode>,
    by_remote_id: HashMap<RemoteId, EntityId>,
    children_by_remote_id: HashMap<EntityId, HashMap<RemoteId, EntityId>>,
    children: HashMap<EntityId, Vec<EntityId>>,
    pending_remote: HashMap<EntityId, Vec<RemoteCollection>>,
    progress: Progress,
    transaction_open: bool,
    retrieval_done: bool,
}

impl CollectionSync {
    pub async fn begin(
        channel: Arc<dyn CommandChannel>,
        resource: ResourceId,
        mode: SyncMode,
        hierarchical_rids: bool,
        streaming: bool,
    ) -> Result<Self> {
        let response = channel
            .call(Command::FetchCollections {
                scope: EntityScope::Single(ROOT_ID),
                depth: FetchDepth::Recursive,
                resource: Some(resource.clone()),
                mime_filter: Vec::new(),
                list_filter: ListFilter::NoFilter,
                fetch_stats: false,
                ancestor_depth: 0,
            })
            .await?;
        let local = match response {
            Response::Collections(collections) => collections,
            _ => Vec::new(),
        };

        let mut nodes = HashMap::new();
        let mut by_remote_id = HashMap::new();
        let mut children_by_remote_id: HashMap<EntityId, HashMap<RemoteId, EntityId>> = HashMap::new();
        let mut children: HashMap<EntityId, Vec<EntityId>> = HashMap::new();

        nodes.insert(
            ROOT_ID,
            LocalNode {
                collection: Collection::new(ROOT_ID, RemoteId::new(), ROOT_ID),
                processed: true,
            },
        );
        for collection in local {
            children.entry(collection.parent).or_default().push(collection.id);
            if !collection.remote_id.is_empty() {
                by_remote_id.insert(collection.remote_id.clone(), collection.id);
                children_by_remote_id
                    .entry(collection.parent)
                    .or_default()
                    .insert(collection.remote_id.clone(), collection.id);
            }
            nodes.insert(
                collection.id,
                LocalNode {
                    collection,
                    processed: false,
                },
            );
        }

        channel.call(Command::BeginTransaction).await?;

        Ok(Self {
            channel,
            resource,
            mode,
            hierarchical_rids,
            streaming,
            nodes,
            by_remote_id,
            children_by_remote_id,
            children,
            pending_remote: HashMap::new(),
            progress: Progress::default(),
            transaction_open: true,
            retrieval_done: !streaming,
        })
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Resolves the local parent id for a hierarchical remote node by
    /// walking its ancestor chain root-down, stopping at the first
    /// unresolved hop.
    fn resolve_hierarchical_parent(&self, chain: &[RemoteId]) -> (EntityId, usize) {
        let mut current = ROOT_ID;
        for (depth, remote_id) in chain.iter().rev().enumerate() {
            match self
                .children_by_remote_id
                .get(&current)
                .and_then(|byrid| byrid.get(remote_id))
            {
                Some(&next) => current = next,
                None => return (current, chain.len() - depth),
            }
        }
        (current, 0)
    }

    /// Feeds one batch of remote listing entries through the matching
    /// algorithm, issuing create/modify/move commands as matches and
    /// parents resolve.
    pub async fn push_changed(&mut self, remote_nodes: Vec<RemoteCollection>) -> Result<()> {
        let mut queue: std::collections::VecDeque<RemoteCollection> = remote_nodes.into();
        while let Some(remote) = queue.pop_front() {
            if remote.collection.remote_id.is_empty() {
                tracing::warn!("remote collection listing entry with no remote id, skipping");
                continue;
            }

            let (parent, unresolved) = if self.hierarchical_rids {
                if remote.remote_ancestor_chain.iter().any(|rid| rid.is_empty()) {
                    return Err(SyncError::Contract(ContractError::MalformedRemoteIdChain(format!(
                        "empty remote id hop in ancestor chain for {:?}",
                        remote.collection.remote_id
                    ))));
                }
                self.resolve_hierarchical_parent(&remote.remote_ancestor_chain)
            } else if self.nodes.contains_key(&remote.collection.parent) {
                (remote.collection.parent, 0)
            } else {
                (remote.collection.parent, 1)
            };

            if unresolved > 0 {
                self.pending_remote.entry(parent).or_default().push(remote);
                continue;
            }

            let existing = self
                .children_by_remote_id
                .get(&parent)
                .and_then(|byrid| byrid.get(&remote.collection.remote_id))
                .copied()
                .or_else(|| {
                    if !self.hierarchical_rids {
                        self.by_remote_id.get(&remote.collection.remote_id).copied()
                    } else {
                        None
                    }
                });

            match existing {
                Some(local_id) => self.apply_modify(local_id, parent, remote.collection).await?,
                None => self.apply_create(parent, remote.collection).await?,
            }

            if let Some(unblocked) = self.pending_remote.remove(&parent) {
                for node in unblocked {
                    queue.push_back(node);
                }
            }
        }
        Ok(())
    }

    async fn apply_modify(&mut self, local_id: EntityId, remote_parent: EntityId, mut remote: Collection) -> Result<()> {
        remote.id = local_id;
        let response = self.channel.call(Command::ModifyCollection(remote.clone())).await?;
        if let Response::Collections(mut updated) = response {
            if let Some(updated) = updated.pop() {
                remote = updated;
            }
        }

        let local_parent = self.nodes.get(&local_id).map(|n| n.collection.parent);
        if !self.hierarchical_rids {
            if let Some(local_parent) = local_parent {
                if local_parent != remote_parent {
                    self.channel
                        .call(Command::MoveCollection {
                            id: local_id,
                            new_parent: remote_parent,
                        })
                        .await?;
                    self.reparent(local_id, local_parent, remote_parent);
                }
            }
        }

        if let Some(node) = self.nodes.get_mut(&local_id) {
            node.collection = remote;
            node.processed = true;
        }
        self.progress.advance(1);
        Ok(())
    }

    async fn apply_create(&mut self, parent: EntityId, mut remote: Collection) -> Result<()> {
        remote.parent = parent;
        remote.resource = self.resource.clone();
        let response = self.channel.call(Command::CreateCollection(remote.clone())).await?;
        let created = match response {
            Response::Collections(mut created) => created.pop().unwrap_or(remote),
            _ => remote,
        };
        let local_id = created.id;
        let remote_id = created.remote_id.clone();

        self.children.entry(parent).or_default().push(local_id);
        if !remote_id.is_empty() {
            self.by_remote_id.insert(remote_id.clone(), local_id);
            self.children_by_remote_id
                .entry(parent)
                .or_default()
                .insert(remote_id, local_id);
        }
        self.nodes.insert(
            local_id,
            LocalNode {
                collection: created,
                processed: true,
            },
        );
        self.progress.advance(1);
        Ok(())
    }

    fn reparent(&mut self, id: EntityId, old_parent: EntityId, new_parent: EntityId) {
        if let Some(siblings) = self.children.get_mut(&old_parent) {
            siblings.retain(|&child| child != id);
        }
        self.children.entry(new_parent).or_default().push(id);
    }

    /// Processes the removed listing (incremental mode only); call once
    /// per batch of removed remote ids.
    pub async fn push_removed(&mut self, removed: Vec<RemoteId>) -> Result<()> {
        if self.mode != SyncMode::Incremental {
            return Ok(());
        }
        for remote_id in removed {
            if let Some(&local_id) = self.by_remote_id.get(&remote_id) {
                self.delete_subtree(local_id).await?;
            }
        }
        Ok(())
    }

    async fn delete_subtree(&mut self, id: EntityId) -> Result<()> {
        let children = self.children.remove(&id).unwrap_or_default();
        for child in children {
            Box::pin(self.delete_subtree(child)).await?;
        }
        self.channel.call(Command::DeleteCollection(id)).await?;
        if let Some(node) = self.nodes.remove(&id) {
            self.by_remote_id.remove(&node.collection.remote_id);
        }
        self.progress.advance(1);
        Ok(())
    }

    /// Marks streaming retrieval complete; a no-op for a non-streaming
    /// sync, which is already considered done after its one
    /// `push_changed`/`push_removed` call.
    pub fn retrieval_done(&mut self) {
        self.retrieval_done = true;
    }

    /// Deletes whatever full mode says is now orphaned (leaf-first),
    /// then commits the transaction. Fails if any remote node is still
    /// parked waiting for a parent that never materialized.
    pub async fn finish(mut self) -> Result<Progress> {
        if !self.retrieval_done {
            return Err(SyncError::IntegrityError(
                "collection sync finished before retrieval_done was called".into(),
            ));
        }

        if !self.pending_remote.is_empty() {
            self.transaction_open = false;
            let _ = self.channel.call(Command::RollbackTransaction).await;
            return Err(SyncError::IntegrityError(
                "root-terminated ancestor chain missing for one or more remote collections".into(),
            ));
        }

        if self.mode == SyncMode::Full {
            let orphans = self.leaf_first_orphans();
            for id in orphans {
                self.channel.call(Command::DeleteCollection(id)).await?;
                self.nodes.remove(&id);
                self.progress.advance(1);
            }
        }

        self.transaction_open = false;
        self.channel.call(Command::CommitTransaction).await?;
        Ok(self.progress)
    }

    fn leaf_first_orphans(&self) -> Vec<EntityId> {
        fn has_processed_descendant(
            id: EntityId,
            nodes: &HashMap<EntityId, LocalNode>,
            children: &HashMap<EntityId, Vec<EntityId>>,
        ) -> bool {
            children.get(&id).into_iter().flatten().any(|&child| {
                nodes.get(&child).is_some_and(|n| n.processed)
                    || has_processed_descendant(child, nodes, children)
            })
        }

        let mut depth_order: Vec<(usize, EntityId)> = self
            .nodes
            .iter()
            .filter(|(&id, node)| {
                id != ROOT_ID
                    && !node.processed
                    && !has_processed_descendant(id, &self.nodes, &self.children)
            })
            .map(|(&id, _)| (self.depth_of(id), id))
            .collect();
        depth_order.sort_by(|a, b| b.0.cmp(&a.0));
        depth_order.into_iter().map(|(_, id)| id).collect()
    }

    fn depth_of(&self, id: EntityId) -> usize {
        let mut depth = 0;
        let mut current = id;
        while let Some(node) = self.nodes.get(&current) {
            if node.collection.parent == current || current == ROOT_ID {
                break;
            }
            current = node.collection.parent;
            depth += 1;
        }
        depth
    }
}

impl Drop for CollectionSync {
    fn drop(&mut self) {
        if self.transaction_open {
            tracing::warn!("collection sync dropped with an open transaction; rollback not issued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;

    fn collection(id: i64, remote_id: &str, parent: i64) -> Collection {
        let mut c = Collection::new(EntityId::from(id), remote_id.as_bytes().to_vec(), EntityId::from(parent));
        c.name = remote_id.to_string();
        c
    }

    #[tokio::test]
    async fn flat_rid_create_and_modify() {
        let channel = Arc::new(RecordingChannel::new(vec![
            Ok(Response::Collections(vec![collection(1, "inbox", 0)])), // initial fetch
            Ok(Response::Ack),                                          // begin transaction
            Ok(Response::Collections(vec![collection(1, "inbox", 0)])), // modify response
            Ok(Response::Collections(vec![collection(2, "sent", 0)])),  // create response
            Ok(Response::Ack),                                         // commit
        ]));

        let mut sync = CollectionSync::begin(
            channel.clone(),
            b"res".to_vec(),
            SyncMode::Incremental,
            false,
            false,
        )
        .await
        .unwrap();

        let mut renamed = collection(0, "inbox", 0);
        renamed.name = "Inbox Renamed".into();
        let new_node = collection(0, "sent", 0);

        sync.push_changed(vec![
            RemoteCollection { collection: renamed, remote_ancestor_chain: Vec::new() },
            RemoteCollection { collection: new_node, remote_ancestor_chain: Vec::new() },
        ])
        .await
        .unwrap();
        sync.retrieval_done();
        let progress = sync.finish().await.unwrap();
        assert_eq!(progress.processed, 2);
    }

    #[tokio::test]
    async fn parked_node_fails_sync_if_parent_never_arrives() {
        let channel = Arc::new(RecordingChannel::new(vec![
            Ok(Response::Collections(vec![])), // initial fetch: empty tree
            Ok(Response::Ack),                 // begin transaction
            Ok(Response::Ack),                 // rollback
        ]));
        let mut sync = CollectionSync::begin(channel, b"res".to_vec(), SyncMode::Incremental, false, false)
            .await
            .unwrap();

        let orphan = collection(0, "child", 999); // parent 999 never resolves
        sync.push_changed(vec![RemoteCollection { collection: orphan, remote_ancestor_chain: Vec::new() }])
            .await
            .unwrap();
        sync.retrieval_done();
        let result = sync.finish().await;
        assert!(result.is_err());
    }

    /// root -> A -> B locally; the resource reports `[A, A/B, A/B/C]` by
    /// ancestor chain instead of by resolved parent id. Only `C` is new,
    /// and it must land under `B`'s local id even though nothing in the
    /// listing carries a usable `parent` field.
    #[tokio::test]
    async fn hierarchical_rid_create_under_a_multi_hop_chain() {
        let channel = Arc::new(RecordingChannel::new(vec![
            Ok(Response::Collections(vec![collection(1, "A", 0), collection(2, "B", 1)])), // initial fetch
            Ok(Response::Ack),                                                              // begin transaction
            Ok(Response::Collections(vec![collection(1, "A", 0)])),                         // modify A
            Ok(Response::Collections(vec![collection(2, "B", 1)])),                         // modify B
            Ok(Response::Collections(vec![collection(3, "C", 2)])),                         // create C, echoed under B
            Ok(Response::Ack),                                                              // commit
        ]));

        let mut sync = CollectionSync::begin(channel, b"res".to_vec(), SyncMode::Incremental, true, false)
            .await
            .unwrap();

        let node_a = RemoteCollection {
            collection: collection(0, "A", 0),
            remote_ancestor_chain: Vec::new(),
        };
        let node_b = RemoteCollection {
            collection: collection(0, "B", 0),
            remote_ancestor_chain: vec![b"A".to_vec()],
        };
        let node_c = RemoteCollection {
            collection: collection(0, "C", 0),
            remote_ancestor_chain: vec![b"B".to_vec(), b"A".to_vec()],
        };

        sync.push_changed(vec![node_a, node_b, node_c]).await.unwrap();
        sync.retrieval_done();
        let progress = sync.finish().await.unwrap();
        assert_eq!(progress.processed, 3);
        assert_eq!(sync.by_remote_id.get(&b"C".to_vec()).copied(), Some(EntityId::from(3)));
        assert_eq!(sync.nodes.get(&EntityId::from(3)).unwrap().collection.parent, EntityId::from(2));
    }

    /// A hierarchical listing entry whose ancestor chain contains an
    /// empty remote id hop is malformed and must fail fast rather than
    /// silently resolving to a wrong parent.
    #[tokio::test]
    async fn malformed_ancestor_chain_is_rejected() {
        let channel = Arc::new(RecordingChannel::new(vec![
            Ok(Response::Collections(vec![])), // initial fetch
            Ok(Response::Ack),                 // begin transaction
        ]));
        let mut sync = CollectionSync::begin(channel, b"res".to_vec(), SyncMode::Incremental, true, false)
            .await
            .unwrap();

        let node = RemoteCollection {
            collection: collection(0, "C", 0),
            remote_ancestor_chain: vec![Vec::new()],
        };
        let result = sync.push_changed(vec![node]).await;
        assert!(matches!(
            result,
            Err(SyncError::Contract(pim_contracts::error::ContractError::MalformedRemoteIdChain(_)))
        ));
    }
}
