//! Integration tests for the layer store, images and garbage collection
//! against the in-memory hypervisor.

use std::sync::Arc;

use proptest::prelude::*;
use virter_core::compress::sha256_digest;
use virter_core::hypervisor::{Hypervisor, MemoryHypervisor};
use virter_core::image::{find_image, image_import_from_reader, image_rm, make_image};
use virter_core::layer::{is_layer_name, LayerOption, LayerStore, VolumeLayer};

const POOL: &str = "default";

fn store() -> (Arc<MemoryHypervisor>, LayerStore) {
    let hv = Arc::new(MemoryHypervisor::new().with_pool(POOL));
    let store = LayerStore::new(hv.clone(), POOL);
    (hv, store)
}

async fn layer_names(hv: &MemoryHypervisor) -> Vec<String> {
    let mut names: Vec<String> = hv
        .volume_list(POOL)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| is_layer_name(n))
        .collect();
    names.sort();
    names
}

/// Store `contents` as a chain, first entry at the root.
async fn build_chain(store: &LayerStore, tag: &str, contents: &[&str]) -> Vec<VolumeLayer> {
    let mut chain: Vec<VolumeLayer> = Vec::new();
    for (i, content) in contents.iter().enumerate() {
        let opts: Vec<LayerOption> = chain
            .last()
            .map(|parent| vec![LayerOption::WithBacking(parent.clone())])
            .unwrap_or_default();
        let work = store
            .new_dynamic_layer(&format!("{tag}-{i}"), &opts)
            .await
            .unwrap();
        let mut reader: &[u8] = content.as_bytes();
        work.upload(&mut reader).await.unwrap();
        chain.push(work.to_volume_layer(None, &[]).await.unwrap());
    }
    chain
}

#[tokio::test]
async fn test_known_content_digest_and_name() {
    let (_hv, store) = store();
    let image = image_import_from_reader(&store, "dl", &mut &b"something to download"[..])
        .await
        .unwrap();
    assert_eq!(
        image.top().name(),
        "virter:layer:sha256:8575b86cb19cdff6a47b8cddc00261c34acc3faea6e120eb6eccbca867c00b4b"
    );
}

#[tokio::test]
async fn test_identical_imports_share_one_layer() {
    let (hv, store) = store();
    let a = image_import_from_reader(&store, "a", &mut &b"same disk"[..])
        .await
        .unwrap();
    let before = layer_names(&hv).await;
    let b = image_import_from_reader(&store, "b", &mut &b"same disk"[..])
        .await
        .unwrap();

    assert_eq!(a.top().name(), b.top().name());
    assert_eq!(layer_names(&hv).await, before);
}

#[tokio::test]
async fn test_chain_reconstruction() {
    let (_hv, store) = store();
    let contents = ["root layer", "middle layer", "top layer"];
    let chain = build_chain(&store, "c", &contents).await;
    let image = make_image(&store, "chained", chain.last().unwrap())
        .await
        .unwrap();

    let layers = image.layers().await.unwrap();
    assert_eq!(layers.len(), 3);
    for (layer, content) in layers.iter().zip(contents) {
        assert_eq!(layer.diff_id(), sha256_digest(content.as_bytes()));
    }
}

#[tokio::test]
async fn test_every_stored_layer_is_immutable() {
    let (_hv, store) = store();
    let chain = build_chain(&store, "imm", &["a", "b"]).await;
    for layer in &chain {
        let err = layer.upload(&mut &b"overwrite"[..]).await.unwrap_err();
        assert!(err.is_immutable());
    }
    // Already stored content does not make uploads possible either.
    let again = build_chain(&store, "imm2", &["a"]).await;
    assert!(again[0].upload(&mut &b"x"[..]).await.unwrap_err().is_immutable());
}

#[tokio::test]
async fn test_gc_respects_live_dependents() {
    let (hv, store) = store();
    let chain = build_chain(&store, "gc", &["one", "two", "three"]).await;
    let image = make_image(&store, "img", &chain[2]).await.unwrap();

    // The tag depends on the top, the top on the middle, and so on.
    for layer in &chain {
        assert!(!store.delete_if_unused(layer.name()).await.unwrap());
    }
    assert_eq!(layer_names(&hv).await.len(), 3);

    image_rm(&store, image.name()).await.unwrap();
    assert!(layer_names(&hv).await.is_empty());
    assert!(find_image(&store, "img").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_all_if_unused_three_layer_chain() {
    let (hv, store) = store();
    let chain = build_chain(&store, "del", &["x", "y", "z"]).await;

    let deleted = store.delete_all_if_unused(chain[2].name()).await.unwrap();
    assert_eq!(deleted.len(), 3);
    assert_eq!(deleted[0], chain[2].name());
    assert!(layer_names(&hv).await.is_empty());
}

#[tokio::test]
async fn test_shared_base_survives_removal_of_one_image() {
    let (hv, store) = store();
    let left = build_chain(&store, "l", &["base", "left"]).await;
    let right = build_chain(&store, "r", &["base", "right"]).await;
    assert_eq!(left[0].name(), right[0].name());

    make_image(&store, "left", &left[1]).await.unwrap();
    make_image(&store, "right", &right[1]).await.unwrap();

    image_rm(&store, "left").await.unwrap();
    let remaining = layer_names(&hv).await;
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&left[0].name().to_string()));
    assert!(!remaining.contains(&left[1].name().to_string()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Untagged chains are fully collected by one prune and tagged chains
    /// are left intact.
    #[test]
    fn prop_prune_collects_untagged_forest(
        chains in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..5), 1..5),
        tagged in proptest::collection::vec(any::<bool>(), 5),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (hv, store) = store();
            let mut kept = std::collections::BTreeSet::new();
            for (i, chain) in chains.iter().enumerate() {
                let contents: Vec<String> = chain
                    .iter()
                    .enumerate()
                    .map(|(j, b)| format!("{i}/{j}/{b}"))
                    .collect();
                let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
                let layers = build_chain(&store, &format!("p{i}"), &refs).await;
                if tagged[i] {
                    make_image(&store, &format!("img{i}"), layers.last().unwrap()).await.unwrap();
                    kept.extend(layers.iter().map(|l| l.name().to_string()));
                }
            }

            store.prune().await.unwrap();
            let left: std::collections::BTreeSet<String> = layer_names(&hv).await.into_iter().collect();
            prop_assert_eq!(left, kept);
            Ok(())
        })?;
    }
}
