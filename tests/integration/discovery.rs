//! Two or more nodes finding each other's store paths.

use std::time::Instant;

use crate::*;

/// def456: B resolves A's copy, streams it, and after A leaves the
/// network a single re-discovery ends in 404.
#[tokio::test]
async fn peer_content_is_resolved_streamed_and_lost() -> Result<()> {
    let mut a = Node::start(&[("def456", b"payload from a")]).await?;
    let b = Node::start(&[]).await?;
    let spy = QuerySpy::bind().await?;
    a.peers.set(vec![b.discovery_addr]);
    b.peers.set(vec![a.discovery_addr, spy.addr]);
    let client = reqwest::Client::new();

    let response = client.get(b.url("def456.narinfo")).send().await?;
    assert_eq!(response.status(), 200);
    let info: NarInfo = response.text().await?.parse()?;
    let route = format!("v2/remote/127.0.0.1/{}/def456/local/nar/", a.http.port());
    assert!(info.url.starts_with(&route), "{}", info.url);
    assert_eq!(info.store_path, a.store_path("def456"));
    assert_eq!(spy.queries().len(), 1);

    let response = client.get(b.url(&info.url)).send().await?;
    assert_eq!(response.status(), 200);
    assert_eq!(&response.bytes().await?[..], b"payload from a");

    a.stop().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = client.get(b.url(&info.url)).send().await?;
    assert_eq!(response.status(), 404);
    let queries = spy.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[1].1, "def456");
    assert_ne!(queries[0].0, queries[1].0);
    Ok(())
}

/// zzz999: nobody has it, and the miss comes back after one query timeout.
#[tokio::test]
async fn miss_is_bounded_by_query_timeout() -> Result<()> {
    let a = Node::start(&[("abc123", b"x")]).await?;
    let b = Node::start(&[]).await?;
    link(&a, &b);

    let started = Instant::now();
    let response = reqwest::get(b.url("zzz999.narinfo")).await?;
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 404);
    assert!(elapsed < QUERY_TIMEOUT + Duration::from_secs(1), "took {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn own_answers_are_ignored() -> Result<()> {
    let node = Node::start(&[("abc123", b"x")]).await?;
    node.peers.set(vec![node.discovery_addr]);

    // Broadcasts come back to the sender; without suppression the node
    // would find its own copy.
    let response = reqwest::get(node.url("abc123.narinfo")).await?;
    assert_eq!(response.status(), 200);

    node.peers.claim(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let response = reqwest::get(node.url("abc123.narinfo")).await?;
    assert_eq!(response.status(), 404);
    Ok(())
}

#[tokio::test]
async fn concurrent_lookups_use_distinct_indices() -> Result<()> {
    let node = Node::start(&[]).await?;
    let spy = QuerySpy::bind().await?;
    node.peers.set(vec![spy.addr]);

    let mut lookups = tokio::task::JoinSet::new();
    for i in 0..8 {
        let url = node.url(&format!("miss{i}.narinfo"));
        lookups.spawn(async move { reqwest::get(url).await.map(|r| r.status()) });
    }
    while let Some(status) = lookups.join_next().await {
        assert_eq!(status??, 404);
    }

    let queries = spy.queries();
    assert_eq!(queries.len(), 8);
    let mut indices: Vec<u32> = queries.iter().map(|(index, _)| *index).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), 8);
    Ok(())
}

#[tokio::test]
async fn first_answer_wins() -> Result<()> {
    let a = Node::start(&[("def456", b"same bytes")]).await?;
    let c = Node::start(&[("def456", b"same bytes")]).await?;
    let b = Node::start(&[]).await?;
    b.peers.set(vec![a.discovery_addr, c.discovery_addr]);

    let info: NarInfo = reqwest::get(b.url("def456.narinfo")).await?.text().await?.parse()?;
    let from_a = info.url.contains(&format!("/{}/def456/", a.http.port()));
    let from_c = info.url.contains(&format!("/{}/def456/", c.http.port()));
    assert!(from_a ^ from_c, "{}", info.url);

    let bytes = reqwest::get(b.url(&info.url)).await?.bytes().await?;
    assert_eq!(&bytes[..], b"same bytes");
    Ok(())
}
