//! Best-effort garbage collection of layers.
//!
//! Every check works on a fresh [`LayerArena`] scan. The backend offers no
//! consistent snapshot, so a concurrent writer can make a check stale; a
//! later pass corrects transient misses. Any volume of the pool counts as a
//! dependent (tags, VM disks and layers alike), foreign backing paths are
//! ignored.

use tracing::{debug, info};

use crate::hypervisor::ObjectKind;

use super::{is_layer_name, LayerError, LayerStore, Parent};

/// Delete `name` unless another volume is backed by it.
///
/// Returns whether the volume was deleted by this call.
pub(super) async fn delete_if_unused(store: &LayerStore, name: &str) -> Result<bool, LayerError> {
    let arena = store.arena().await?;
    if !arena.contains(name) {
        return Ok(false);
    }
    if arena.has_dependents(name) {
        debug!(layer = %name, "Layer still in use");
        return Ok(false);
    }
    delete(store, name).await
}

/// Delete `name`, then walk towards the root deleting each layer that has
/// no dependents left. Stops at the first layer still in use.
pub(super) async fn delete_all_if_unused(
    store: &LayerStore,
    name: &str,
) -> Result<Vec<String>, LayerError> {
    let mut deleted = Vec::new();
    let mut next = Some(name.to_string());

    while let Some(current) = next.take() {
        let arena = store.arena().await?;
        let Some(parent) = arena.parent(&current).cloned() else {
            break;
        };
        if arena.has_dependents(&current) {
            debug!(layer = %current, "Layer still in use");
            break;
        }
        if !delete(store, &current).await? {
            break;
        }
        deleted.push(current);

        next = match parent {
            Parent::Volume(p) if is_layer_name(&p) => Some(p),
            _ => None,
        };
    }

    Ok(deleted)
}

/// Delete unused layers until a full pass makes no progress.
pub(super) async fn prune(store: &LayerStore) -> Result<Vec<String>, LayerError> {
    let mut deleted = Vec::new();

    loop {
        let arena = store.arena().await?;
        let unused: Vec<String> = arena
            .names()
            .filter(|n| is_layer_name(n) && !arena.has_dependents(n))
            .map(str::to_string)
            .collect();

        let mut progress = false;
        for name in unused {
            let removed = delete_all_if_unused(store, &name).await?;
            progress |= !removed.is_empty();
            deleted.extend(removed);
        }
        if !progress {
            break;
        }
    }

    if !deleted.is_empty() {
        info!(count = deleted.len(), "Pruned unused layers");
    }
    Ok(deleted)
}

async fn delete(store: &LayerStore, name: &str) -> Result<bool, LayerError> {
    match store.conn().volume_delete(store.pool(), name).await {
        Ok(()) => {
            debug!(layer = %name, "Deleted layer");
            Ok(true)
        }
        Err(e) if e.is_not_found_of(ObjectKind::Volume) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::hypervisor::{Hypervisor, MemoryHypervisor};
    use crate::layer::{LayerOption, LayerStore, VolumeLayer};

    async fn chain(store: &LayerStore, contents: &[&[u8]]) -> Vec<VolumeLayer> {
        let mut layers: Vec<VolumeLayer> = Vec::new();
        for (i, content) in contents.iter().enumerate() {
            let opts: Vec<LayerOption> = layers
                .last()
                .map(|l| LayerOption::WithBacking(l.clone()))
                .into_iter()
                .collect();
            let raw = store
                .new_dynamic_layer(&format!("l{i}"), &opts)
                .await
                .unwrap();
            raw.upload(&mut &content[..]).await.unwrap();
            layers.push(raw.to_volume_layer(None, &[]).await.unwrap());
        }
        layers
    }

    #[tokio::test]
    async fn test_used_layer_is_kept() {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let store = LayerStore::new(hv.clone(), "p");
        let layers = chain(&store, &[b"a", b"b"]).await;

        assert!(!store.delete_if_unused(layers[0].name()).await.unwrap());
        assert!(store.delete_if_unused(layers[1].name()).await.unwrap());
        assert!(store.delete_if_unused(layers[0].name()).await.unwrap());
        assert!(hv.volume_list("p").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_all_three_layer_chain() {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let store = LayerStore::new(hv.clone(), "p");
        let layers = chain(&store, &[b"a", b"b", b"c"]).await;

        let deleted = store.delete_all_if_unused(layers[2].name()).await.unwrap();
        let expected: Vec<String> = layers.iter().rev().map(|l| l.name().to_string()).collect();
        assert_eq!(deleted, expected);
        assert!(hv.volume_list("p").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_all_stops_at_shared_parent() {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let store = LayerStore::new(hv.clone(), "p");
        let base = chain(&store, &[b"base"]).await.remove(0);

        let mut tops = Vec::new();
        for content in [&b"x"[..], &b"y"[..]] {
            let raw = store
                .new_dynamic_layer("top", &[LayerOption::WithBacking(base.clone())])
                .await
                .unwrap();
            raw.upload(&mut &content[..]).await.unwrap();
            tops.push(raw.to_volume_layer(None, &[]).await.unwrap());
        }

        let deleted = store.delete_all_if_unused(tops[0].name()).await.unwrap();
        assert_eq!(deleted, vec![tops[0].name().to_string()]);
        assert!(store.find_raw_layer(base.name()).await.unwrap().is_some());

        let deleted = store.delete_all_if_unused(tops[1].name()).await.unwrap();
        assert_eq!(deleted.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let store = LayerStore::new(hv, "p");
        assert!(!store.delete_if_unused("virter:layer:gone").await.unwrap());
        assert!(store
            .delete_all_if_unused("virter:layer:gone")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_tagged_chain() {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let store = LayerStore::new(hv.clone(), "p");
        let kept = chain(&store, &[b"a", b"b"]).await;
        let dropped = chain(&store, &[b"c", b"d"]).await;

        // A plain volume backed by the top keeps the whole chain alive.
        store
            .create_layer("vm", &[LayerOption::WithBacking(kept[1].clone())])
            .await
            .unwrap();

        let mut pruned = store.prune().await.unwrap();
        pruned.sort();
        let mut expected: Vec<String> = dropped.iter().map(|l| l.name().to_string()).collect();
        expected.sort();
        assert_eq!(pruned, expected);
        assert_eq!(hv.volume_list("p").await.unwrap().len(), 3);
    }
}
