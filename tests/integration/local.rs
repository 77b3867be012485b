//! A single node serving its own store.

use crate::*;

use nixpeer_core::CacheInfo;
use nixpeer_store::local::encode_token;

#[tokio::test]
async fn cache_info_reports_store_and_priority() -> Result<()> {
    let node = Node::start(&[]).await?;
    let response = reqwest::get(node.url("nix-cache-info")).await?;
    assert_eq!(response.status(), 200);

    let info: CacheInfo = response.text().await?.parse()?;
    assert_eq!(info.priority, 20);
    assert_eq!(info.want_mass_query, 1);
    assert_eq!(format!("{}/x-pkg", info.store_dir), node.store_path("x"));
    Ok(())
}

/// abc123: the record's URL opens exactly the bytes the producer writes.
#[tokio::test]
async fn local_record_opens_producer_output() -> Result<()> {
    let node = Node::start(&[("abc123", b"the nar of abc123")]).await?;

    let response = reqwest::get(node.url("local/abc123.narinfo")).await?;
    assert_eq!(response.status(), 200);
    let info: NarInfo = response.text().await?.parse()?;
    assert_eq!(info.store_path, node.store_path("abc123"));
    assert_eq!(info.url, format!("local/nar/{}", encode_token(&info.store_path)));
    assert_eq!(info.nar_size, 17);

    let response = reqwest::get(node.url(&info.url)).await?;
    assert_eq!(response.status(), 200);
    assert_eq!(&response.bytes().await?[..], b"the nar of abc123");
    Ok(())
}

#[tokio::test]
async fn unknown_local_hash_is_not_found() -> Result<()> {
    let node = Node::start(&[("abc123", b"x")]).await?;
    let response = reqwest::get(node.url("local/nope00.narinfo")).await?;
    assert_eq!(response.status(), 404);
    Ok(())
}

#[tokio::test]
async fn paths_outside_the_store_are_refused() -> Result<()> {
    let node = Node::start(&[("abc123", b"x")]).await?;

    for path in ["/etc/passwd".to_string(), format!("{}/../../etc/passwd", node.store_path("abc123"))] {
        let response = reqwest::get(node.url(&format!("local/nar/{}", encode_token(&path)))).await?;
        assert_eq!(response.status(), 404, "{path}");
    }
    let response = reqwest::get(node.url("local/nar/not-base64!.nar")).await?;
    assert_eq!(response.status(), 404);
    Ok(())
}
