mod common;

use common::cluster;

use mirrex_config::{QuorumCount, ReadHashMode, ReplicationOptions};
use mirrex_core::ReadArgs;
use mirrex_model::{ChildMask, Errno, FileType, Gfid, Xdata, keys, pending_key};

#[tokio::test]
async fn gfid_hash_selection_is_deterministic() {
    let options = ReplicationOptions {
        read_hash_mode: ReadHashMode::GfidHash,
        ..ReplicationOptions::default()
    };
    let c = cluster(3, options).await;
    let readable = ChildMask::all(3);
    let args = ReadArgs {
        gfid: Gfid::new(),
        ia_type: FileType::Regular,
    };

    let first = c.set.select_read_child(&readable, &args);
    for _ in 0..10 {
        assert_eq!(c.set.select_read_child(&readable, &args), first);
    }
}

#[tokio::test]
async fn gfid_hash_spreads_across_replicas() {
    let options = ReplicationOptions {
        read_hash_mode: ReadHashMode::GfidHash,
        ..ReplicationOptions::default()
    };
    let c = cluster(3, options).await;
    let readable = ChildMask::all(3);

    let mut chosen = std::collections::HashSet::new();
    for _ in 0..64 {
        let args = ReadArgs {
            gfid: Gfid::new(),
            ia_type: FileType::Regular,
        };
        if let Some(child) = c.set.select_read_child(&readable, &args) {
            chosen.insert(child);
        }
    }
    assert_eq!(chosen.len(), 3, "64 files should hit every replica");
}

#[tokio::test]
async fn pinned_read_child_wins_when_readable() {
    let options = ReplicationOptions {
        read_child: Some(2),
        read_hash_mode: ReadHashMode::GfidHash,
        ..ReplicationOptions::default()
    };
    let c = cluster(3, options).await;
    let args = ReadArgs {
        gfid: Gfid::new(),
        ia_type: FileType::Regular,
    };

    assert_eq!(c.set.select_read_child(&ChildMask::all(3), &args), Some(2));
    let without_pin = ChildMask::from_bits(0b011, 3);
    assert_ne!(
        c.set.select_read_child(&without_pin, &args),
        Some(2),
        "an unreadable pin falls through the ladder"
    );
}

#[tokio::test]
async fn least_latency_policy_follows_ping_samples() {
    let options = ReplicationOptions {
        read_hash_mode: ReadHashMode::LeastLatency,
        ..ReplicationOptions::default()
    };
    let c = cluster(3, options).await;
    use mirrex_model::ChildEvent;
    c.set.notify_child(0, ChildEvent::Ping(40)).await;
    c.set.notify_child(1, ChildEvent::Ping(3)).await;
    c.set.notify_child(2, ChildEvent::Ping(17)).await;

    let args = ReadArgs {
        gfid: Gfid::new(),
        ia_type: FileType::Regular,
    };
    assert_eq!(c.set.select_read_child(&ChildMask::all(3), &args), Some(1));

    let without_1 = ChildMask::from_bits(0b101, 3);
    assert_eq!(c.set.select_read_child(&without_1, &args), Some(2));
}

#[tokio::test]
async fn arbiter_never_serves_data() {
    let options = ReplicationOptions {
        arbiter_count: 1,
        quorum: QuorumCount::Auto,
        read_hash_mode: ReadHashMode::GfidHash,
        ..ReplicationOptions::default()
    };
    let c = cluster(3, options).await;
    let gfid = Gfid::new();
    c.seed_everywhere(gfid, b"payload");

    let outcome = c.set.lookup(gfid).await.expect("lookup");
    assert_ne!(outcome.read_child, 0, "index 0 is the arbiter");

    let (data, _, _) = c.set.inode_ctx(gfid).read_subvol_get(3);
    assert!(!data.get(0), "arbiter data bit is always clear");

    for _ in 0..16 {
        let args = ReadArgs {
            gfid: Gfid::new(),
            ia_type: FileType::Regular,
        };
        let choice = c.set.select_read_child(&ChildMask::all(3), &args);
        assert_ne!(choice, Some(0));
    }
}

#[tokio::test]
async fn read_fails_over_when_the_read_child_dies_mid_read() {
    let c = cluster(2, ReplicationOptions::default()).await;
    let gfid = Gfid::new();
    c.seed_everywhere(gfid, b"survivable");
    let fd = c.set.open(gfid, Xdata::new()).await.expect("open");
    c.set.readv(fd, 16, 0).await.expect("prime");

    // Brick 0 starts failing without a topology event; the read retries on
    // the other replica and flags the maps for re-derivation.
    c.brick(0).fail_op("readv", Errno::ENOTCONN);
    let data = c.set.readv(fd, 16, 0).await.expect("failover read");
    assert_eq!(data, b"survivable");
    assert!(
        c.set
            .inode_ctx(gfid)
            .needs_refresh(2, c.set.current_event_generation())
    );
}

#[tokio::test]
async fn getxattr_serves_plain_keys_from_a_replica() {
    let c = cluster(2, ReplicationOptions::default()).await;
    let gfid = Gfid::new();
    c.seed_everywhere(gfid, b"x");
    for brick in &c.bricks {
        brick.set_xattr(gfid, "user.tag", b"blue".to_vec());
    }
    let value = c.set.getxattr(gfid, "user.tag").await.expect("getxattr");
    assert_eq!(value, b"blue");
    assert_eq!(
        c.set.getxattr(gfid, "user.missing").await.err(),
        Some(Errno::ENODATA)
    );
}

/// Directories only need a metadata source; a data-dimension disagreement
/// does not gate them.
#[tokio::test]
async fn directories_survive_entry_accusations_for_stat() {
    let c = cluster(2, ReplicationOptions::default()).await;
    let gfid = Gfid::new();
    for brick in &c.bricks {
        brick.seed_dir(gfid);
    }
    c.brick(0).set_pending(
        gfid,
        &pending_key("brick1"),
        mirrex_model::ChangelogCounts {
            data: 0,
            metadata: 0,
            entry: 1,
        },
    );
    c.brick(1).set_pending(
        gfid,
        &pending_key("brick0"),
        mirrex_model::ChangelogCounts {
            data: 0,
            metadata: 0,
            entry: 1,
        },
    );

    let iatt = c.set.stat(gfid).await.expect("dir stat survives");
    assert_eq!(iatt.ia_type, FileType::Directory);
}

#[tokio::test]
async fn content_rides_the_content_xdata_key() {
    let c = cluster(2, ReplicationOptions::default()).await;
    let gfid = Gfid::new();
    c.seed_everywhere(gfid, b"0123456789");
    let fd = c.set.open(gfid, Xdata::new()).await.expect("open");

    let chunk = c.set.readv(fd, 4, 3).await.expect("ranged read");
    assert_eq!(chunk, b"3456");
    assert_eq!(keys::CONTENT_XDATA, "glusterfs.content");
}
