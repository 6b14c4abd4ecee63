// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Synchronization of nested metric mappings.
//!
//! A [`MetricMap`] keeps insertion order, and two ranks may well have inserted the
//! same metrics in different orders. Before exchanging anything the leaves are
//! flattened to `(path, value)` pairs and sorted by path, so position `i` means the
//! same metric on every rank.
//!
//! A metric that is [`Metric::Missing`] is left out rather than treated as zero.
//! Ranks first exchange their path sets and only paths present on every rank are
//! synchronized; a metric computed by some ranks only is dropped from the result on
//! all of them.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::values::{SyncedValues, ValueSynchronizer};
use crate::collective::IntoReduction;
use crate::device::DeviceId;
use crate::error::{DistError, Result};

/// Path from the root of a [`MetricMap`] to one of its leaves.
pub type MetricPath = Vec<String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metric {
    Value(f64),
    /// One value per rank, in rank order. Produced by stacked synchronization.
    PerRank(Vec<f64>),
    Map(MetricMap),
    /// Not computed on this rank; skipped by synchronization.
    Missing,
}

impl From<f64> for Metric {
    fn from(value: f64) -> Self {
        Self::Value(value)
    }
}

impl From<Option<f64>> for Metric {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::Missing, Self::Value)
    }
}

impl From<Vec<f64>> for Metric {
    fn from(values: Vec<f64>) -> Self {
        Self::PerRank(values)
    }
}

impl From<MetricMap> for Metric {
    fn from(map: MetricMap) -> Self {
        Self::Map(map)
    }
}

/// Insertion-ordered mapping from names to metrics or nested mappings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricMap(IndexMap<String, Metric>);

impl MetricMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, metric: impl Into<Metric>) -> Self {
        self.insert(key, metric);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, metric: impl Into<Metric>) -> Option<Metric> {
        self.0.insert(key.into(), metric.into())
    }

    pub fn get(&self, key: &str) -> Option<&Metric> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Metric)> {
        self.0.iter()
    }

    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Metric> {
        let (last, parents) = path.split_last()?;
        let mut current = self;
        for key in parents {
            match current.0.get(key.as_ref())? {
                Metric::Map(map) => current = map,
                _ => return None,
            }
        }
        current.0.get(last.as_ref())
    }

    /// Write `metric` at `path`, creating intermediate mappings as needed. A leaf in
    /// the way of an intermediate mapping is replaced.
    pub fn set_path(&mut self, path: &[String], metric: Metric) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut current = self;
        for key in parents {
            let slot = current
                .0
                .entry(key.clone())
                .or_insert_with(|| Metric::Map(MetricMap::new()));
            if !matches!(slot, Metric::Map(_)) {
                *slot = Metric::Map(MetricMap::new());
            }
            let Metric::Map(map) = slot else {
                return;
            };
            current = map;
        }
        current.0.insert(last.clone(), metric);
    }

    /// Every `(path, value)` pair with a present numeric leaf, in insertion order.
    pub fn flatten(&self) -> Vec<(MetricPath, f64)> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        self.flatten_into(&mut prefix, &mut out);
        out
    }

    fn flatten_into(&self, prefix: &mut MetricPath, out: &mut Vec<(MetricPath, f64)>) {
        for (key, metric) in &self.0 {
            prefix.push(key.clone());
            match metric {
                Metric::Value(v) => out.push((prefix.clone(), *v)),
                Metric::Map(map) => map.flatten_into(prefix, out),
                Metric::Missing | Metric::PerRank(_) => {}
            }
            prefix.pop();
        }
    }
}

impl<K: Into<String>, M: Into<Metric>> FromIterator<(K, M)> for MetricMap {
    fn from_iter<T: IntoIterator<Item = (K, M)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, m)| (k.into(), m.into()))
                .collect(),
        )
    }
}

/// Synchronizes a [`MetricMap`] across the group.
#[derive(Debug, Clone)]
pub struct MetricSynchronizer {
    values: ValueSynchronizer,
}

impl MetricSynchronizer {
    pub fn new(values: ValueSynchronizer) -> Self {
        Self { values }
    }

    /// Returns a fresh mapping holding the synchronized value of every present leaf
    /// at its original path. Stacked synchronization stores a [`Metric::PerRank`]
    /// leaf. Outside a group the input comes back untouched.
    pub async fn sync(
        &self,
        metrics: MetricMap,
        device: DeviceId,
        mode: impl IntoReduction,
    ) -> Result<MetricMap> {
        let mode = mode.into_reduction()?;
        if !self.values.reducer().context().is_distributed() {
            return Ok(metrics);
        }

        let leaves: BTreeMap<MetricPath, f64> = metrics.flatten().into_iter().collect();
        let common = self.agree_paths(&leaves).await?;
        if common.len() < leaves.len() {
            tracing::warn!(
                dropped = leaves.len() - common.len(),
                "metrics missing on some ranks are left out of synchronization"
            );
        }
        let (paths, values): (Vec<MetricPath>, Vec<f64>) = leaves
            .into_iter()
            .filter(|(path, _)| common.contains(path))
            .unzip();

        tracing::debug!(num_metrics = paths.len(), %mode, "synchronizing metrics");
        let synced = self.values.sync(values, device, mode).await?;

        let mut out = MetricMap::new();
        match synced {
            SyncedValues::Reduced(values) => {
                for (path, value) in paths.iter().zip(values) {
                    out.set_path(path, Metric::Value(value));
                }
            }
            SyncedValues::Stacked(rows) => {
                for (i, path) in paths.iter().enumerate() {
                    let per_rank = rows.iter().filter_map(|row| row.get(i).copied()).collect();
                    out.set_path(path, Metric::PerRank(per_rank));
                }
            }
        }
        Ok(out)
    }

    /// Exchange path sets and keep the paths every rank has.
    async fn agree_paths(&self, own: &BTreeMap<MetricPath, f64>) -> Result<BTreeSet<MetricPath>> {
        let mut common: BTreeSet<MetricPath> = own.keys().cloned().collect();
        let Some(transport) = self.values.reducer().context().transport() else {
            return Ok(common);
        };

        let payload = serde_json::to_vec(&common)
            .map_err(|e| DistError::protocol(format!("failed to encode metric paths: {e}")))?;
        let gathered = transport.all_gather(Bytes::from(payload)).await?;

        for (rank, bytes) in gathered.iter().enumerate() {
            let theirs: BTreeSet<MetricPath> = serde_json::from_slice(bytes).map_err(|e| {
                DistError::protocol(format!("rank {rank} sent malformed metric paths: {e}"))
            })?;
            common.retain(|path| theirs.contains(path));
        }
        Ok(common)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::CollectiveReducer;
    use crate::distributed::DistributedContext;
    use std::sync::Arc;

    fn path(keys: &[&str]) -> MetricPath {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_flatten_drops_missing_leaves() {
        let metrics = MetricMap::new()
            .with("loss", MetricMap::new().with("train", 1.0).with("val", None::<f64>))
            .with("lr", 3e-4);

        assert_eq!(
            metrics.flatten(),
            vec![(path(&["loss", "train"]), 1.0), (path(&["lr"]), 3e-4)]
        );
    }

    #[test]
    fn test_set_path_creates_intermediate_maps() {
        let mut metrics = MetricMap::new();
        metrics.set_path(&path(&["a", "b", "c"]), Metric::Value(1.0));
        metrics.set_path(&path(&["a", "d"]), Metric::Value(2.0));

        assert_eq!(metrics.get_path(&["a", "b", "c"]), Some(&Metric::Value(1.0)));
        assert_eq!(metrics.get_path(&["a", "d"]), Some(&Metric::Value(2.0)));
        assert_eq!(metrics.get_path(&["a", "x"]), None);
    }

    #[test]
    fn test_serde_round_shape() {
        let metrics = MetricMap::new()
            .with("loss", MetricMap::new().with("train", 2.0))
            .with("per_rank", vec![1.0, 3.0])
            .with("skipped", None::<f64>);
        let json = serde_json::to_string(&metrics).unwrap();
        assert_eq!(
            json,
            r#"{"loss":{"train":2.0},"per_rank":[1.0,3.0],"skipped":null}"#
        );
        let back: MetricMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metrics);
    }

    #[tokio::test]
    async fn test_single_process_returns_input_untouched() {
        let sync = MetricSynchronizer::new(ValueSynchronizer::new(CollectiveReducer::new(
            Arc::new(DistributedContext::new()),
        )));
        // Missing leaves survive because nothing is flattened.
        let metrics = MetricMap::new().with("b", 1.0).with("a", None::<f64>);
        let out = sync
            .sync(metrics.clone(), DeviceId::new(0), "mean")
            .await
            .unwrap();
        assert_eq!(out, metrics);

        let err = sync
            .sync(metrics, DeviceId::new(0), "max")
            .await
            .unwrap_err();
        assert!(err.is_unsupported_reduction());
    }
}
