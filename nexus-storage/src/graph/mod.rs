//! Typed graph access over a [`KvStore`].
//!
//! Nodes, links and rlinks are stored as JSON property maps under the key
//! layout in [`crate::keys`]. Every record has an immutable `_created`
//! sibling written on first create; a record without its created marker is
//! treated as absent.
//!
//! Store calls go through [`with_retry`]; property updates are a
//! read, merge, compare-and-swap loop on the record's mod revision.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nexus_core::{
    child_id, copy_without_fixed, get_str, last_segment, link_prop, new_change_id, node_id_of,
    node_prop, now_timestamp, path_to_json, GraphError, GraphLink, GraphNode, NexusConfig,
    NexusResult, NodePath, Properties, RetryConfig, StoreError, UpdateRetryConfig,
    UpsertLinkRequest, DEFAULT_KEY_NAME,
};
use serde_json::Value;

use crate::keys::{
    created_key, link_key, links_prefix, parent_link_key, rlink_key, rlinks_prefix,
    source_of_link_key, CREATED, LINKS, RLINKS,
};
use crate::kv::{prefix_range_end, Compare, GetResponse, KeyValue, KvStore, TxnOp, TxnResponse};
use crate::retry::with_retry;

pub mod stats;

pub use stats::GraphStoreStats;
use stats::{bump, GraphStoreCounters};

fn encode(key: &str, props: &Properties) -> NexusResult<Vec<u8>> {
    serde_json::to_vec(props).map_err(|e| {
        StoreError::Codec {
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn decode(kv: &KeyValue) -> NexusResult<Properties> {
    if kv.value.is_empty() {
        return Ok(Properties::new());
    }
    match serde_json::from_slice::<Value>(&kv.value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(GraphError::MalformedRecord {
            key: kv.key.clone(),
            reason: format!("expected object, got {other}"),
        }
        .into()),
        Err(e) => Err(GraphError::MalformedRecord {
            key: kv.key.clone(),
            reason: e.to_string(),
        }
        .into()),
    }
}

fn created_marker(dm_id: &str) -> Properties {
    let mut p = Properties::new();
    p.insert(node_prop::CREATED_BY.into(), Value::from(dm_id));
    p.insert(node_prop::CREATION_TIME.into(), Value::from(now_timestamp()));
    p
}

fn merge(into: &mut Properties, from: Properties) {
    for (k, v) in from {
        into.insert(k, v);
    }
}

fn stamp_update(props: &mut Properties, dm_id: &str) {
    props.insert(node_prop::UPDATED_BY.into(), Value::from(dm_id));
    props.insert(node_prop::UPDATE_TIME.into(), Value::from(now_timestamp()));
}

/// Graph store access layer.
pub struct GraphStore {
    kv: Arc<dyn KvStore>,
    retry: RetryConfig,
    update_retry: UpdateRetryConfig,
    rlink_enabled: bool,
    counters: GraphStoreCounters,
}

impl GraphStore {
    pub fn new(kv: Arc<dyn KvStore>, config: &NexusConfig) -> Self {
        Self {
            kv,
            retry: config.retry.clone(),
            update_retry: config.update_retry.clone(),
            rlink_enabled: config.rlink_enabled(),
            counters: GraphStoreCounters::default(),
        }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn rlink_enabled(&self) -> bool {
        self.rlink_enabled
    }

    pub fn stats(&self) -> GraphStoreStats {
        self.counters.snapshot()
    }

    // ------------------------------------------------------------------
    // Store primitives
    // ------------------------------------------------------------------

    async fn get(&self, key: &str) -> NexusResult<GetResponse> {
        bump(&self.counters.db_read, 1);
        with_retry(&self.retry, "get", || self.kv.get(key)).await
    }

    async fn get_prefix(&self, prefix: &str) -> NexusResult<GetResponse> {
        bump(&self.counters.db_read, 1);
        with_retry(&self.retry, "get_prefix", || self.kv.get_prefix(prefix)).await
    }

    async fn range(&self, start: &str, end: &str, limit: usize) -> NexusResult<GetResponse> {
        bump(&self.counters.db_read, 1);
        with_retry(&self.retry, "range", || self.kv.range(start, end, limit)).await
    }

    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> NexusResult<TxnResponse> {
        bump(&self.counters.db_write, 1);
        with_retry(&self.retry, "txn", || {
            self.kv
                .txn(compares.clone(), success.clone(), failure.clone())
        })
        .await
    }

    /// Value and metadata of `key` together with its created marker.
    async fn get_with_created(&self, key: &str) -> NexusResult<Option<(KeyValue, Properties)>> {
        let record = self.get(key).await?;
        let Some(kv) = record.kvs.into_iter().next() else {
            return Ok(None);
        };
        let created = self.get(&created_key(key)).await?;
        let Some(ckv) = created.first() else {
            return Ok(None);
        };
        Ok(Some((kv, decode(ckv)?)))
    }

    /// Writes the created marker of `key` if it does not exist yet.
    async fn ensure_created(&self, key: &str, dm_id: &str) -> NexusResult<()> {
        let ckey = created_key(key);
        self.txn(
            vec![Compare::CreateRevision {
                key: ckey.clone(),
                revision: 0,
            }],
            vec![TxnOp::put(ckey.clone(), encode(&ckey, &created_marker(dm_id))?)],
            vec![],
        )
        .await?;
        Ok(())
    }

    async fn read_created(&self, key: &str) -> NexusResult<Properties> {
        let resp = self.get(&created_key(key)).await?;
        match resp.first() {
            Some(kv) => decode(kv),
            None => Ok(Properties::new()),
        }
    }

    /// All link or rlink records under `prefix`, paired with created markers.
    async fn read_link_dir(&self, owner_id: &str, prefix: &str) -> NexusResult<Vec<GraphLink>> {
        let resp = self.get_prefix(prefix).await?;
        let mut records: BTreeMap<String, (String, KeyValue)> = BTreeMap::new();
        let mut created: BTreeMap<String, Properties> = BTreeMap::new();
        for kv in resp.kvs {
            let rest = &kv.key[prefix.len()..];
            let parts: Vec<&str> = rest.split('/').collect();
            match parts.as_slice() {
                [t, _] => {
                    let link_type = t.to_string();
                    records.insert(kv.key.clone(), (link_type, kv));
                }
                [_, _, leaf] if *leaf == CREATED => {
                    let base = kv.key[..kv.key.len() - CREATED.len() - 1].to_string();
                    created.insert(base, decode(&kv)?);
                }
                _ => {}
            }
        }

        let mut out = Vec::with_capacity(records.len());
        for (key, (link_type, kv)) in records {
            let Some(c) = created.remove(&key) else {
                continue;
            };
            let mut properties = decode(&kv)?;
            merge(&mut properties, c);
            properties.insert(node_prop::REVISION.into(), Value::from(kv.mod_revision));
            let destination_node_id = get_str(&properties, link_prop::DEST_NODE_ID)
                .unwrap_or_default()
                .to_string();
            out.push(GraphLink {
                id: key,
                link_type,
                source_node_id: owner_id.to_string(),
                destination_node_id,
                properties,
            });
        }
        bump(&self.counters.link_read, out.len() as u64);
        Ok(out)
    }

    pub async fn get_links(&self, node_id: &str) -> NexusResult<Vec<GraphLink>> {
        self.read_link_dir(node_id, &links_prefix(node_id)).await
    }

    pub async fn get_rlinks(&self, node_id: &str) -> NexusResult<Vec<GraphLink>> {
        self.read_link_dir(node_id, &rlinks_prefix(node_id)).await
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Create or update a root node `/<node_type>/<node_name>`.
    pub async fn upsert_node(
        &self,
        dm_id: &str,
        node_type: &str,
        node_name: &str,
        node_props: &Properties,
    ) -> NexusResult<GraphNode> {
        let id = node_id_of(&[NodePath::new(node_type, node_name)]);
        let mut props = copy_without_fixed(node_props);
        props.insert(DEFAULT_KEY_NAME.into(), Value::from(node_name));
        props.insert(node_prop::IS_ROOT.into(), Value::from("true"));
        props.insert(node_prop::KEY_NAME.into(), Value::from(DEFAULT_KEY_NAME));
        props.insert(node_prop::CHANGE_ID.into(), Value::from(new_change_id()));
        stamp_update(&mut props, dm_id);

        let ckey = created_key(&id);
        let created = created_marker(dm_id);
        let body = encode(&id, &props)?;
        let resp = self
            .txn(
                vec![Compare::CreateRevision {
                    key: ckey.clone(),
                    revision: 0,
                }],
                vec![
                    TxnOp::put(ckey.clone(), encode(&ckey, &created)?),
                    TxnOp::put(id.clone(), body.clone()),
                ],
                vec![TxnOp::put(id.clone(), body)],
            )
            .await?;
        bump(&self.counters.node_update, 1);

        let created = if resp.succeeded {
            created
        } else {
            self.read_created(&id).await?
        };
        merge(&mut props, created);
        props.insert(node_prop::REVISION.into(), Value::from(resp.header_revision));
        Ok(GraphNode {
            links: self.get_links(&id).await?,
            rlinks: self.get_rlinks(&id).await?,
            id,
            node_type: node_type.to_string(),
            properties: props,
        })
    }

    /// Create or update a child of `parent_id` together with the hard link
    /// from the parent, in one transaction.
    ///
    /// # Panics
    ///
    /// Panics if `node_props` lacks the key property or its value contains `/`.
    pub async fn upsert_child_node(
        &self,
        dm_id: &str,
        parent_id: &str,
        link_key_name: Option<&str>,
        link_props: &Properties,
        node_type: &str,
        node_props: &Properties,
    ) -> NexusResult<(GraphNode, GraphLink)> {
        let key_name = link_key_name.unwrap_or(DEFAULT_KEY_NAME);
        let name = match get_str(node_props, key_name) {
            Some(n) => n.to_string(),
            None => panic!("key property {key_name} is missing from node properties"),
        };
        assert!(
            !name.contains('/'),
            "node key value {name:?} must not contain '/'"
        );

        let id = child_id(parent_id, node_type, &name);
        let lid = link_key(parent_id, node_type, &name);

        let mut props = copy_without_fixed(node_props);
        props.insert(node_prop::IS_ROOT.into(), Value::from("false"));
        props.insert(node_prop::KEY_NAME.into(), Value::from(key_name));
        props.insert(key_name.to_string(), Value::from(name.as_str()));
        props.insert(node_prop::CHANGE_ID.into(), Value::from(new_change_id()));
        stamp_update(&mut props, dm_id);

        let mut lprops = copy_without_fixed(link_props);
        lprops.insert(link_prop::NODE_KEY_NAME.into(), Value::from(key_name));
        lprops.insert(link_prop::NODE_KEY_VALUE.into(), Value::from(name.as_str()));
        lprops.insert(link_prop::NODE_TYPE.into(), Value::from(node_type));
        lprops.insert(link_prop::HARD_LINK.into(), Value::from("true"));
        lprops.insert(link_prop::DEST_NODE_ID.into(), Value::from(id.as_str()));
        stamp_update(&mut lprops, dm_id);

        let nckey = created_key(&id);
        let lckey = created_key(&lid);
        let created = created_marker(dm_id);
        let nbody = encode(&id, &props)?;
        let lbody = encode(&lid, &lprops)?;
        let resp = self
            .txn(
                vec![Compare::CreateRevision {
                    key: nckey.clone(),
                    revision: 0,
                }],
                vec![
                    TxnOp::put(nckey.clone(), encode(&nckey, &created)?),
                    TxnOp::put(lckey.clone(), encode(&lckey, &created)?),
                    TxnOp::put(id.clone(), nbody.clone()),
                    TxnOp::put(lid.clone(), lbody.clone()),
                ],
                vec![TxnOp::put(id.clone(), nbody), TxnOp::put(lid.clone(), lbody)],
            )
            .await?;
        bump(&self.counters.node_update, 1);
        bump(&self.counters.link_add, 1);

        let (node_created, link_created, links, rlinks) = if resp.succeeded {
            (created.clone(), created, Vec::new(), Vec::new())
        } else {
            self.ensure_created(&lid, dm_id).await?;
            (
                self.read_created(&id).await?,
                self.read_created(&lid).await?,
                self.get_links(&id).await?,
                self.get_rlinks(&id).await?,
            )
        };
        merge(&mut props, node_created);
        props.insert(node_prop::REVISION.into(), Value::from(resp.header_revision));
        merge(&mut lprops, link_created);
        lprops.insert(link_prop::REVISION.into(), Value::from(resp.header_revision));

        let node = GraphNode {
            id: id.clone(),
            node_type: node_type.to_string(),
            properties: props,
            links,
            rlinks,
        };
        let link = GraphLink {
            id: lid,
            link_type: node_type.to_string(),
            source_node_id: parent_id.to_string(),
            destination_node_id: id,
            properties: lprops,
        };
        Ok((node, link))
    }

    /// Full snapshot of a node: properties, links and rlinks.
    pub async fn describe_node(&self, node_id: &str) -> NexusResult<Option<GraphNode>> {
        let Some((kv, created)) = self.get_with_created(node_id).await? else {
            return Ok(None);
        };
        bump(&self.counters.node_read, 1);
        let mut properties = decode(&kv)?;
        merge(&mut properties, created);
        properties.insert(node_prop::REVISION.into(), Value::from(kv.mod_revision));
        let node_type = last_segment(node_id)
            .map(|(t, _)| t.to_string())
            .unwrap_or_default();
        Ok(Some(GraphNode {
            id: node_id.to_string(),
            node_type,
            properties,
            links: self.get_links(node_id).await?,
            rlinks: self.get_rlinks(node_id).await?,
        }))
    }

    /// Properties only, for background re-sync.
    pub async fn get_node_property(&self, node_id: &str) -> NexusResult<Option<Properties>> {
        let Some((kv, created)) = self.get_with_created(node_id).await? else {
            return Ok(None);
        };
        bump(&self.counters.node_read, 1);
        let mut properties = decode(&kv)?;
        merge(&mut properties, created);
        properties.insert(node_prop::REVISION.into(), Value::from(kv.mod_revision));
        Ok(Some(properties))
    }

    /// Delete a node record, everything stored beneath it and, for a
    /// non-root, the parent's link to it.
    pub async fn delete_node(&self, node_id: &str) -> NexusResult<i64> {
        let mut ops = vec![
            TxnOp::delete_prefix(format!("{node_id}/")),
            TxnOp::delete(node_id),
        ];
        if let Some(plink) = parent_link_key(node_id) {
            ops.push(TxnOp::delete(created_key(&plink)));
            ops.push(TxnOp::delete(plink));
            bump(&self.counters.link_delete, 1);
        }
        let resp = self.txn(vec![], ops, vec![]).await?;
        Ok(resp.deleted)
    }

    /// Read, mutate and compare-and-swap `key` until the write lands.
    ///
    /// Returns the revision of the write, or 0 if `key` does not exist.
    async fn cas_update<F>(&self, key: &str, mutate: F) -> NexusResult<i64>
    where
        F: Fn(&mut Properties),
    {
        let delay = Duration::from_millis(self.update_retry.retry_delay_ms);
        for attempt in 0..=self.update_retry.max_retries {
            let resp = self.get(key).await?;
            let Some(kv) = resp.first() else {
                tracing::warn!(key, "property update on missing record dropped");
                return Ok(0);
            };
            let mut props = decode(kv)?;
            mutate(&mut props);
            let t = self
                .txn(
                    vec![Compare::ModRevision {
                        key: key.to_string(),
                        revision: kv.mod_revision,
                    }],
                    vec![TxnOp::put(key, encode(key, &props)?)],
                    vec![],
                )
                .await?;
            if t.succeeded && t.header_revision > resp.header_revision {
                return Ok(t.header_revision);
            }
            tracing::debug!(key, attempt, "property update conflicted, retrying");
            tokio::time::sleep(delay).await;
        }
        Err(GraphError::UpdateConflict {
            id: key.to_string(),
            attempts: self.update_retry.max_retries + 1,
        }
        .into())
    }

    /// Merge `props` into a node. Reserved names are ignored.
    pub async fn update_node_add_properties(
        &self,
        dm_id: &str,
        node_id: &str,
        props: &Properties,
    ) -> NexusResult<i64> {
        let add = copy_without_fixed(props);
        if add.is_empty() {
            return Ok(0);
        }
        bump(&self.counters.node_update, 1);
        self.cas_update(node_id, |p| {
            merge(p, add.clone());
            stamp_update(p, dm_id);
            p.insert(node_prop::CHANGE_ID.into(), Value::from(new_change_id()));
        })
        .await
    }

    /// Remove property names from a node. Reserved names are ignored.
    pub async fn update_node_remove_properties(
        &self,
        dm_id: &str,
        node_id: &str,
        keys: &[String],
    ) -> NexusResult<i64> {
        let keys: Vec<&String> = keys
            .iter()
            .filter(|k| !nexus_core::is_fixed_prop(k))
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        bump(&self.counters.node_update, 1);
        self.cas_update(node_id, |p| {
            for k in &keys {
                p.remove(k.as_str());
            }
            stamp_update(p, dm_id);
            p.insert(node_prop::CHANGE_ID.into(), Value::from(new_change_id()));
        })
        .await
    }

    /// Durably mark a node as being deleted, the crash-resume marker of
    /// a delete-tree walk.
    pub async fn mark_to_be_deleted(&self, dm_id: &str, node_id: &str) -> NexusResult<i64> {
        bump(&self.counters.node_update, 1);
        self.cas_update(node_id, |p| {
            p.insert(node_prop::TO_BE_DELETED.into(), Value::Bool(true));
            stamp_update(p, dm_id);
            p.insert(node_prop::CHANGE_ID.into(), Value::from(new_change_id()));
        })
        .await
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Create or update a soft link and, when enabled, its rlink in one
    /// transaction.
    pub async fn upsert_link(
        &self,
        dm_id: &str,
        req: &UpsertLinkRequest,
    ) -> NexusResult<(GraphLink, Option<GraphLink>)> {
        let src = &req.source;
        let dst = &req.destination;
        let lid = link_key(&src.node_id, &dst.node_type, &dst.key_value);
        let rid = rlink_key(&dst.node_id, &src.node_type, &src.key_value);

        let mut lprops = copy_without_fixed(&req.properties);
        lprops.insert(link_prop::HARD_LINK.into(), Value::from("false"));
        lprops.insert(link_prop::NODE_KEY_NAME.into(), Value::from(dst.key_name.as_str()));
        lprops.insert(link_prop::NODE_KEY_VALUE.into(), Value::from(dst.key_value.as_str()));
        lprops.insert(link_prop::NODE_TYPE.into(), Value::from(dst.node_type.as_str()));
        lprops.insert(link_prop::DEST_NODE_ID.into(), Value::from(dst.node_id.as_str()));
        lprops.insert(
            link_prop::SOFT_LINK_DEST_PATH.into(),
            Value::from(path_to_json(&dst.path)),
        );
        stamp_update(&mut lprops, dm_id);

        let mut rprops = copy_without_fixed(&req.properties);
        rprops.insert(link_prop::HARD_LINK.into(), Value::from("false"));
        rprops.insert(link_prop::NODE_KEY_NAME.into(), Value::from(src.key_name.as_str()));
        rprops.insert(link_prop::NODE_KEY_VALUE.into(), Value::from(src.key_value.as_str()));
        rprops.insert(link_prop::NODE_TYPE.into(), Value::from(src.node_type.as_str()));
        rprops.insert(link_prop::DEST_NODE_ID.into(), Value::from(src.node_id.as_str()));
        rprops.insert(
            link_prop::RSOFT_LINK_DEST_PATH.into(),
            Value::from(path_to_json(&src.path)),
        );
        rprops.insert(link_prop::FORWARD_LINK_ID.into(), Value::from(lid.as_str()));
        stamp_update(&mut rprops, dm_id);

        let created = created_marker(dm_id);
        let lckey = created_key(&lid);
        let rckey = created_key(&rid);
        let lbody = encode(&lid, &lprops)?;
        let rbody = encode(&rid, &rprops)?;

        let mut success = vec![
            TxnOp::put(lckey.clone(), encode(&lckey, &created)?),
            TxnOp::put(lid.clone(), lbody.clone()),
        ];
        let mut failure = vec![TxnOp::put(lid.clone(), lbody)];
        if self.rlink_enabled {
            success.push(TxnOp::put(rckey.clone(), encode(&rckey, &created)?));
            success.push(TxnOp::put(rid.clone(), rbody.clone()));
            failure.push(TxnOp::put(rid.clone(), rbody));
        }
        let resp = self
            .txn(
                vec![Compare::CreateRevision {
                    key: lckey.clone(),
                    revision: 0,
                }],
                success,
                failure,
            )
            .await?;
        bump(&self.counters.link_add, 1);

        let (lcreated, rcreated) = if resp.succeeded {
            (created.clone(), created)
        } else {
            if self.rlink_enabled {
                self.ensure_created(&rid, dm_id).await?;
            }
            (self.read_created(&lid).await?, self.read_created(&rid).await?)
        };
        merge(&mut lprops, lcreated);
        lprops.insert(link_prop::REVISION.into(), Value::from(resp.header_revision));
        let link = GraphLink {
            id: lid,
            link_type: dst.node_type.clone(),
            source_node_id: src.node_id.clone(),
            destination_node_id: dst.node_id.clone(),
            properties: lprops,
        };

        let rlink = if self.rlink_enabled {
            bump(&self.counters.rlink_add, 1);
            merge(&mut rprops, rcreated);
            rprops.insert(link_prop::REVISION.into(), Value::from(resp.header_revision));
            Some(GraphLink {
                id: rid,
                link_type: src.node_type.clone(),
                source_node_id: dst.node_id.clone(),
                destination_node_id: src.node_id.clone(),
                properties: rprops,
            })
        } else {
            None
        };
        Ok((link, rlink))
    }

    /// Read a link (or rlink) record by its key.
    pub async fn describe_link_by_id(&self, link_id: &str) -> NexusResult<Option<GraphLink>> {
        let Some((kv, created)) = self.get_with_created(link_id).await? else {
            return Ok(None);
        };
        bump(&self.counters.link_read, 1);
        let mut properties = decode(&kv)?;
        merge(&mut properties, created);
        properties.insert(link_prop::REVISION.into(), Value::from(kv.mod_revision));
        let link_type = get_str(&properties, link_prop::NODE_TYPE)
            .map(String::from)
            .or_else(|| segment_before_last(link_id).map(String::from))
            .unwrap_or_default();
        let source_node_id = source_of_link_key(link_id).unwrap_or_default().to_string();
        let destination_node_id = get_str(&properties, link_prop::DEST_NODE_ID)
            .unwrap_or_default()
            .to_string();
        Ok(Some(GraphLink {
            id: link_id.to_string(),
            link_type,
            source_node_id,
            destination_node_id,
            properties,
        }))
    }

    /// Read the link from `source_id` of `link_type` to `dest_id`.
    pub async fn describe_link(
        &self,
        link_type: &str,
        source_id: &str,
        dest_id: &str,
    ) -> NexusResult<Option<GraphLink>> {
        let Some((_, dest_key)) = last_segment(dest_id) else {
            return Ok(None);
        };
        self.describe_link_by_id(&link_key(source_id, link_type, dest_key))
            .await
    }

    /// Delete a link record and its created marker. Returns the number of
    /// keys removed.
    pub async fn delete_link(&self, link_id: &str) -> NexusResult<i64> {
        let resp = self
            .txn(
                vec![],
                vec![TxnOp::delete(link_id), TxnOp::delete(created_key(link_id))],
                vec![],
            )
            .await?;
        bump(&self.counters.link_delete, 1);
        Ok(resp.deleted)
    }

    /// Delete a soft link and its rlink together.
    pub async fn delete_link_with_reverse(&self, link_id: &str, rlink_id: &str) -> NexusResult<i64> {
        let resp = self
            .txn(
                vec![],
                vec![
                    TxnOp::delete(link_id),
                    TxnOp::delete(created_key(link_id)),
                    TxnOp::delete(rlink_id),
                    TxnOp::delete(created_key(rlink_id)),
                ],
                vec![],
            )
            .await?;
        bump(&self.counters.link_delete, 1);
        bump(&self.counters.rlink_delete, 1);
        Ok(resp.deleted)
    }

    /// Delete every soft link pointing at `node_id`, found through its
    /// reverse index, along with the rlinks. Returns the rlinks removed.
    pub async fn delete_links(&self, node_id: &str) -> NexusResult<Vec<GraphLink>> {
        let rlinks = self.get_rlinks(node_id).await?;
        if rlinks.is_empty() {
            return Ok(rlinks);
        }
        let (node_type, node_key) = last_segment(node_id).unwrap_or_default();
        let mut ops = Vec::with_capacity(rlinks.len() * 4);
        for r in &rlinks {
            let forward = get_str(&r.properties, link_prop::FORWARD_LINK_ID)
                .map(String::from)
                .unwrap_or_else(|| link_key(&r.destination_node_id, node_type, node_key));
            ops.push(TxnOp::delete(created_key(&forward)));
            ops.push(TxnOp::delete(forward));
            ops.push(TxnOp::delete(created_key(&r.id)));
            ops.push(TxnOp::delete(r.id.clone()));
        }
        self.txn(vec![], ops, vec![]).await?;
        bump(&self.counters.link_delete, rlinks.len() as u64);
        bump(&self.counters.rlink_delete, rlinks.len() as u64);
        Ok(rlinks)
    }

    /// Merge `props` into a link record.
    pub async fn update_link_add_properties(
        &self,
        dm_id: &str,
        link_id: &str,
        props: &Properties,
    ) -> NexusResult<i64> {
        let add = copy_without_fixed(props);
        if add.is_empty() {
            return Ok(0);
        }
        bump(&self.counters.link_update, 1);
        self.cas_update(link_id, |p| {
            merge(p, add.clone());
            stamp_update(p, dm_id);
        })
        .await
    }

    /// Remove property names from a link record.
    pub async fn update_link_remove_properties(
        &self,
        dm_id: &str,
        link_id: &str,
        keys: &[String],
    ) -> NexusResult<i64> {
        let keys: Vec<&String> = keys
            .iter()
            .filter(|k| !nexus_core::is_fixed_prop(k))
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        bump(&self.counters.link_update, 1);
        self.cas_update(link_id, |p| {
            for k in &keys {
                p.remove(k.as_str());
            }
            stamp_update(p, dm_id);
        })
        .await
    }

    // ------------------------------------------------------------------
    // Paging
    // ------------------------------------------------------------------

    /// Up to `count` link records directly under `dir`, in key order,
    /// strictly after `start` (or from the beginning when empty).
    async fn next_records(&self, dir: &str, start: &str, count: usize) -> NexusResult<Vec<KeyValue>> {
        let mut out = Vec::new();
        if count == 0 {
            return Ok(out);
        }
        let first = format!("{dir}/");
        let end = prefix_range_end(&first);
        let mut cursor = if start.is_empty() {
            first.clone()
        } else {
            format!("{first}{start}\u{0}")
        };
        let batch = count * 2 + 2;
        loop {
            let resp = self.range(&cursor, &end, batch).await?;
            let fetched = resp.kvs.len();
            let mut last = None;
            for kv in resp.kvs {
                let tail = &kv.key[first.len()..];
                if !tail.contains('/') && tail != start {
                    last = Some(kv.key.clone());
                    out.push(kv);
                    if out.len() == count {
                        return Ok(out);
                    }
                } else {
                    last = Some(kv.key.clone());
                }
            }
            match last {
                Some(k) if fetched == batch => cursor = format!("{k}\u{0}"),
                _ => return Ok(out),
            }
        }
    }

    /// Next `count` child keys of type `node_type` under `node_id` after
    /// `start`.
    pub async fn next_link_keys(
        &self,
        node_id: &str,
        node_type: &str,
        start: &str,
        count: usize,
    ) -> NexusResult<Vec<String>> {
        let dir = format!("{node_id}/{LINKS}/{node_type}");
        let records = self.next_records(&dir, start, count).await?;
        Ok(records
            .into_iter()
            .map(|kv| kv.key[dir.len() + 1..].to_string())
            .collect())
    }

    /// Next `count` source NodeIDs of type `node_type` holding soft links to
    /// `node_id`, after the source key `start`.
    pub async fn next_rlink_keys(
        &self,
        node_id: &str,
        node_type: &str,
        start: &str,
        count: usize,
    ) -> NexusResult<Vec<String>> {
        let dir = format!("{node_id}/{RLINKS}/{node_type}");
        let records = self.next_records(&dir, start, count).await?;
        let mut out = Vec::with_capacity(records.len());
        for kv in records {
            let props = decode(&kv)?;
            if let Some(dest) = get_str(&props, link_prop::DEST_NODE_ID) {
                out.push(dest.to_string());
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Revisions
    // ------------------------------------------------------------------

    pub async fn latest_revision(&self) -> NexusResult<i64> {
        with_retry(&self.retry, "current_revision", || self.kv.current_revision()).await
    }

    pub async fn compact_revision(&self, revision: i64, physical: bool) -> NexusResult<i64> {
        with_retry(&self.retry, "compact", || self.kv.compact(revision, physical)).await
    }
}

fn segment_before_last(key: &str) -> Option<&str> {
    last_segment(key).map(|(t, _)| t)
}

// =============================================================================
// TESTS
// =============================================================================
