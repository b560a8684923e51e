use std::{collections::BTreeSet, fmt, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transform::{Quaternion, Transform, Vector3};

/// Default maximum distance between a stored stamp and a lookup time.
pub const DEFAULT_VALIDITY_WINDOW_MS: i64 = 10_000;

/// Resolution failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    /// Neither `target → source` nor `source → target` is stored.
    #[error("no transform from `{source_frame}` to `{target_frame}`")]
    NotFound {
        /// Requested target frame.
        target_frame: String,
        /// Requested source frame.
        source_frame: String,
    },
    /// An edge exists but none is within the validity window.
    #[error(
        "transform from `{source_frame}` to `{target_frame}` stamped {stamp} is outside the \
         {window_ms} ms window around {requested}"
    )]
    Expired {
        /// Requested target frame.
        target_frame: String,
        /// Requested source frame.
        source_frame: String,
        /// Stamp of the closest stored edge.
        stamp: DateTime<Utc>,
        /// Lookup time.
        requested: DateTime<Utc>,
        /// Validity window in milliseconds.
        window_ms: i64,
    },
    /// Rotation quaternion could not be normalized.
    #[error("invalid rotation {0:?} for `{1}` → `{2}`")]
    InvalidRotation(Quaternion, String, String),
    /// Parent and child name the same frame.
    #[error("frame `{0}` cannot be its own parent")]
    SelfLoop(String),
}

/// A stored edge of the frame graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedTransform {
    /// Frame the transform maps into.
    pub parent: String,
    /// Frame the transform maps from.
    pub child: String,
    /// Child pose in the parent frame.
    pub transform: Transform,
    /// Time the transform was measured.
    pub stamp: DateTime<Utc>,
}

type EdgeKey = (String, String);

/// Directed graph of timestamped transforms between named frames.
///
/// `set_transform(parent, child, ..)` stores the pose of `child` in `parent`.
/// `lookup_transform(target, source, t)` returns the transform that maps
/// `source` coordinates into `target` coordinates. It uses the stored edge
/// `(target, source)` when one is fresh, otherwise the inverse of the stored
/// edge `(source, target)`. Chains through intermediate frames are not
/// resolved.
///
/// Cloning is cheap and every clone shares the same edges.
#[derive(Clone)]
pub struct TransformGraph {
    edges: Arc<RwLock<IndexMap<EdgeKey, StampedTransform>>>,
    validity_window: Duration,
}

impl fmt::Debug for TransformGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformGraph")
            .field("edges", &self.edges.read().len())
            .field("validity_window", &self.validity_window)
            .finish()
    }
}

impl Default for TransformGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformGraph {
    /// Empty graph with the default 10 s validity window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_validity_window(Duration::milliseconds(DEFAULT_VALIDITY_WINDOW_MS))
    }

    /// Empty graph with a custom validity window.
    #[must_use]
    pub fn with_validity_window(validity_window: Duration) -> Self {
        Self {
            edges: Arc::new(RwLock::new(IndexMap::new())),
            validity_window: validity_window.abs(),
        }
    }

    /// Configured validity window.
    #[must_use]
    pub const fn validity_window(&self) -> Duration {
        self.validity_window
    }

    /// Inserts or replaces the `(parent, child)` edge.
    pub fn set_transform(
        &self,
        parent: &str,
        child: &str,
        translation: Vector3,
        rotation: Quaternion,
        stamp: DateTime<Utc>,
    ) -> Result<(), TransformError> {
        let transform = Transform::new(translation, rotation).ok_or_else(|| {
            TransformError::InvalidRotation(rotation, parent.to_string(), child.to_string())
        })?;
        self.insert(StampedTransform {
            parent: parent.to_string(),
            child: child.to_string(),
            transform,
            stamp,
        })
    }

    /// Inserts or replaces an already built edge.
    pub fn insert(&self, edge: StampedTransform) -> Result<(), TransformError> {
        if edge.parent == edge.child {
            return Err(TransformError::SelfLoop(edge.parent));
        }
        tracing::trace!(parent = %edge.parent, child = %edge.child, stamp = %edge.stamp, "transform set");
        self.edges
            .write()
            .insert((edge.parent.clone(), edge.child.clone()), edge);
        Ok(())
    }

    /// Resolves the transform mapping `source` coordinates into `target`
    /// coordinates at time `at`.
    pub fn lookup_transform(
        &self,
        target: &str,
        source: &str,
        at: DateTime<Utc>,
    ) -> Result<StampedTransform, TransformError> {
        if target == source {
            return Ok(StampedTransform {
                parent: target.to_string(),
                child: source.to_string(),
                transform: Transform::identity(),
                stamp: at,
            });
        }

        let edges = self.edges.read();
        let direct = edges.get(&(target.to_string(), source.to_string()));
        if let Some(edge) = direct.filter(|edge| self.is_fresh(edge.stamp, at)) {
            return Ok(edge.clone());
        }

        let reverse = edges.get(&(source.to_string(), target.to_string()));
        if let Some(edge) = reverse.filter(|edge| self.is_fresh(edge.stamp, at)) {
            return Ok(StampedTransform {
                parent: target.to_string(),
                child: source.to_string(),
                transform: edge.transform.inverse(),
                stamp: edge.stamp,
            });
        }

        let closest = direct
            .into_iter()
            .chain(reverse)
            .map(|edge| edge.stamp)
            .min_by_key(|stamp| (*stamp - at).abs());
        drop(edges);

        Err(match closest {
            Some(stamp) => TransformError::Expired {
                target_frame: target.to_string(),
                source_frame: source.to_string(),
                stamp,
                requested: at,
                window_ms: self.validity_window.num_milliseconds(),
            },
            None => TransformError::NotFound {
                target_frame: target.to_string(),
                source_frame: source.to_string(),
            },
        })
    }

    /// Whether [`Self::lookup_transform`] would succeed.
    #[must_use]
    pub fn can_transform(&self, target: &str, source: &str, at: DateTime<Utc>) -> bool {
        self.lookup_transform(target, source, at).is_ok()
    }

    /// Maps a point from `source` into `target` using the transform valid now.
    pub fn transform_point(
        &self,
        point: Vector3,
        target: &str,
        source: &str,
    ) -> Result<Vector3, TransformError> {
        self.transform_point_at(point, target, source, Utc::now())
    }

    /// Maps a point from `source` into `target` at time `at`.
    pub fn transform_point_at(
        &self,
        point: Vector3,
        target: &str,
        source: &str,
        at: DateTime<Utc>,
    ) -> Result<Vector3, TransformError> {
        let edge = self.lookup_transform(target, source, at)?;
        Ok(edge.transform.transform_point(point))
    }

    /// Rotates a direction vector from `source` into `target` using the
    /// transform valid now.
    pub fn transform_vector(
        &self,
        vector: Vector3,
        target: &str,
        source: &str,
    ) -> Result<Vector3, TransformError> {
        self.transform_vector_at(vector, target, source, Utc::now())
    }

    /// Rotates a direction vector from `source` into `target` at time `at`.
    pub fn transform_vector_at(
        &self,
        vector: Vector3,
        target: &str,
        source: &str,
        at: DateTime<Utc>,
    ) -> Result<Vector3, TransformError> {
        let edge = self.lookup_transform(target, source, at)?;
        Ok(edge.transform.transform_vector(vector))
    }

    /// Every frame seen as a parent or child, sorted.
    #[must_use]
    pub fn list_frames(&self) -> Vec<String> {
        let edges = self.edges.read();
        let frames: BTreeSet<&String> = edges
            .keys()
            .flat_map(|(parent, child)| [parent, child])
            .collect();
        frames.into_iter().cloned().collect()
    }

    /// Snapshot of the stored edges in insertion order.
    #[must_use]
    pub fn edges(&self) -> Vec<StampedTransform> {
        self.edges.read().values().cloned().collect()
    }

    /// Removes the `(parent, child)` edge.
    pub fn remove_transform(&self, parent: &str, child: &str) -> bool {
        self.edges
            .write()
            .shift_remove(&(parent.to_string(), child.to_string()))
            .is_some()
    }

    /// Drops every edge stamped before `cutoff`, returning how many were removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut edges = self.edges.write();
        let before = edges.len();
        edges.retain(|_, edge| edge.stamp >= cutoff);
        before - edges.len()
    }

    fn is_fresh(&self, stamp: DateTime<Utc>, at: DateTime<Utc>) -> bool {
        (stamp - at).abs() <= self.validity_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::IDENTITY_ROTATION;
    use std::f64::consts::FRAC_PI_2;

    const EPS: f64 = 1e-9;

    fn close3(a: Vector3, b: Vector3) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < EPS)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn odom_to_base_link_point() {
        let graph = TransformGraph::new();
        graph
            .set_transform("odom", "base_link", [1.0, 0.0, 0.0], IDENTITY_ROTATION, t0())
            .unwrap();
        let p = graph
            .transform_point_at([0.0, 0.0, 0.0], "odom", "base_link", t0())
            .unwrap();
        assert!(close3(p, [1.0, 0.0, 0.0]));
        let back = graph
            .transform_point_at([0.0, 0.0, 0.0], "base_link", "odom", t0())
            .unwrap();
        assert!(close3(back, [-1.0, 0.0, 0.0]));
    }

    #[test]
    fn direct_and_reverse_lookups_are_inverses() {
        let graph = TransformGraph::new();
        let rotation = Transform::from_euler([0.0; 3], 0.1, 0.2, FRAC_PI_2).rotation;
        graph
            .set_transform("map", "odom", [2.0, -1.0, 0.5], rotation, t0())
            .unwrap();

        let forward = graph.lookup_transform("map", "odom", t0()).unwrap();
        let backward = graph.lookup_transform("odom", "map", t0()).unwrap();
        assert_eq!(forward.parent, "map");
        assert_eq!(backward.parent, "odom");
        assert_eq!(backward.child, "map");

        let f = forward.transform;
        let b = backward.transform;
        let conj = [-f.rotation[0], -f.rotation[1], -f.rotation[2], f.rotation[3]];
        assert!(b.rotation.iter().zip(conj).all(|(x, y)| (x - y).abs() < EPS));
        let neg = [-f.translation[0], -f.translation[1], -f.translation[2]];
        let expected = Transform::from_translation([0.0; 3]);
        let expected = Transform {
            rotation: conj,
            ..expected
        }
        .transform_vector(neg);
        assert!(close3(b.translation, expected));
        assert!(f.compose(&b).approx_eq(&Transform::identity(), EPS));
    }

    #[test]
    fn expiry_window_is_inclusive() {
        let graph = TransformGraph::new();
        graph
            .set_transform("odom", "base_link", [1.0, 0.0, 0.0], IDENTITY_ROTATION, t0())
            .unwrap();
        let window = graph.validity_window();
        let eps = Duration::milliseconds(1);

        assert!(graph.can_transform("odom", "base_link", t0() + window - eps));
        assert!(graph.can_transform("odom", "base_link", t0() + window));
        assert!(graph.can_transform("base_link", "odom", t0() - window + eps));
        let err = graph
            .lookup_transform("odom", "base_link", t0() + window + eps)
            .unwrap_err();
        assert!(matches!(err, TransformError::Expired { window_ms: 10_000, .. }));
        assert!(!graph.can_transform("base_link", "odom", t0() + window + eps));
    }

    #[test]
    fn stale_direct_edge_falls_back_to_fresh_reverse() {
        let graph = TransformGraph::with_validity_window(Duration::seconds(1));
        graph
            .set_transform("a", "b", [1.0, 0.0, 0.0], IDENTITY_ROTATION, t0())
            .unwrap();
        let later = t0() + Duration::seconds(5);
        graph
            .set_transform("b", "a", [3.0, 0.0, 0.0], IDENTITY_ROTATION, later)
            .unwrap();
        let edge = graph.lookup_transform("a", "b", later).unwrap();
        assert!(close3(edge.transform.translation, [-3.0, 0.0, 0.0]));
        assert_eq!(edge.stamp, later);
    }

    #[test]
    fn chains_are_not_resolved() {
        let graph = TransformGraph::new();
        graph
            .set_transform("map", "odom", [1.0, 0.0, 0.0], IDENTITY_ROTATION, t0())
            .unwrap();
        graph
            .set_transform("odom", "base_link", [1.0, 0.0, 0.0], IDENTITY_ROTATION, t0())
            .unwrap();
        let err = graph.lookup_transform("map", "base_link", t0()).unwrap_err();
        assert_eq!(
            err,
            TransformError::NotFound {
                target_frame: "map".into(),
                source_frame: "base_link".into(),
            }
        );
    }

    #[test]
    fn last_write_wins() {
        let graph = TransformGraph::new();
        graph
            .set_transform("odom", "base_link", [1.0, 0.0, 0.0], IDENTITY_ROTATION, t0())
            .unwrap();
        graph
            .set_transform("odom", "base_link", [4.0, 0.0, 0.0], IDENTITY_ROTATION, t0())
            .unwrap();
        assert_eq!(graph.edges().len(), 1);
        let p = graph
            .transform_point_at([0.0; 3], "odom", "base_link", t0())
            .unwrap();
        assert!(close3(p, [4.0, 0.0, 0.0]));
    }

    #[test]
    fn vectors_ignore_translation() {
        let graph = TransformGraph::new();
        let yaw = Transform::from_euler([0.0; 3], 0.0, 0.0, FRAC_PI_2).rotation;
        graph
            .set_transform("odom", "base_link", [5.0, 5.0, 0.0], yaw, Utc::now())
            .unwrap();
        let v = graph
            .transform_vector([1.0, 0.0, 0.0], "odom", "base_link")
            .unwrap();
        assert!(close3(v, [0.0, 1.0, 0.0]));
        let p = graph
            .transform_point([1.0, 0.0, 0.0], "odom", "base_link")
            .unwrap();
        assert!(close3(p, [5.0, 6.0, 0.0]));
    }

    #[test]
    fn frames_and_housekeeping() {
        let graph = TransformGraph::new();
        graph
            .set_transform("map", "odom", [0.0; 3], IDENTITY_ROTATION, t0())
            .unwrap();
        graph
            .set_transform(
                "odom",
                "base_link",
                [0.0; 3],
                IDENTITY_ROTATION,
                t0() + Duration::seconds(30),
            )
            .unwrap();
        assert_eq!(graph.list_frames(), vec!["base_link", "map", "odom"]);
        assert_eq!(graph.prune_older_than(t0() + Duration::seconds(1)), 1);
        assert!(graph.remove_transform("odom", "base_link"));
        assert!(!graph.remove_transform("odom", "base_link"));
        assert!(graph.list_frames().is_empty());
    }

    #[test]
    fn rejects_bad_input() {
        let graph = TransformGraph::new();
        assert!(matches!(
            graph.set_transform("a", "b", [0.0; 3], [0.0; 4], t0()),
            Err(TransformError::InvalidRotation(..))
        ));
        assert_eq!(
            graph.set_transform("a", "a", [0.0; 3], IDENTITY_ROTATION, t0()),
            Err(TransformError::SelfLoop("a".into()))
        );
        let same = graph.lookup_transform("x", "x", t0()).unwrap();
        assert_eq!(same.transform, Transform::identity());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_and_readers() {
        let graph = TransformGraph::new();
        let mut tasks = Vec::new();
        for worker in 0..4 {
            let graph = graph.clone();
            tasks.push(tokio::spawn(async move {
                let child = format!("sensor_{worker}");
                for i in 0..100 {
                    graph
                        .set_transform(
                            "base_link",
                            &child,
                            [f64::from(i), 0.0, 0.0],
                            IDENTITY_ROTATION,
                            Utc::now(),
                        )
                        .unwrap();
                    let _ = graph.lookup_transform(&child, "base_link", Utc::now());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(graph.list_frames().len(), 5);
        let last = graph
            .lookup_transform("base_link", "sensor_0", Utc::now())
            .unwrap();
        assert!(close3(last.transform.translation, [99.0, 0.0, 0.0]));
    }
}
