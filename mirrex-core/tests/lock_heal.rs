mod common;

use common::{Cluster, cluster, wait_for};

use mirrex_config::{QuorumCount, ReplicationOptions};
use mirrex_contracts::FdId;
use mirrex_model::{Errno, Flock, Gfid, LkCmd, LkOwner, Xdata, keys};

fn quorum2() -> ReplicationOptions {
    ReplicationOptions {
        quorum: QuorumCount::Fixed(2),
        ..ReplicationOptions::default()
    }
}

const OWNER: LkOwner = LkOwner(0xDEAD);

/// Take a mandatory write lock [0,100) through the replica set.
async fn hold_mandatory_lock(c: &Cluster, gfid: Gfid) -> FdId {
    c.seed_everywhere(gfid, b"locked-file");
    let mut xdata = Xdata::new();
    xdata.mark(keys::MANDATORY_LOCK_XATTR);
    let fd = c.set.open(gfid, xdata.clone()).await.expect("open");
    c.set
        .lk(fd, LkCmd::SetLk, Flock::write(0, 100, OWNER), xdata)
        .await
        .expect("lock granted");
    fd
}

/// Scenario: a replica bounces while a mandatory lock is held and nobody
/// touched the lock meanwhile. The heal replays it and the record returns
/// to the tracking queue with all nodes locked.
#[tokio::test]
async fn lock_heal_after_clean_reconnect() {
    let c = cluster(3, quorum2()).await;
    let gfid = Gfid::new();
    let fd = hold_mandatory_lock(&c, gfid).await;

    let (saved, healq) = c.set.lock_heal_queue_sizes();
    assert_eq!((saved, healq), (1, 0));
    assert!(c.brick(2).has_posix_lock(gfid, OWNER));

    c.child_down(2).await;
    assert_eq!(
        c.set.lock_heal_nodes(fd).expect("record").bits(),
        0b011,
        "downed node dropped from the record"
    );

    c.child_up(2).await;
    let set = c.set.clone();
    wait_for(
        || set.lock_heal_queue_sizes() == (1, 0),
        "record back on saved_locks",
    )
    .await;
    assert_eq!(c.set.lock_heal_nodes(fd).expect("record").bits(), 0b111);
    assert!(
        c.brick(2).has_posix_lock(gfid, OWNER),
        "lock re-asserted on the reconnected replica"
    );

    // Invisible to the holder: the fd still works.
    c.set.writev(fd, b"still mine", 0).await.expect("write");
}

/// Scenario: a fencing client stole the lock on the bounced replica. The
/// heal must notice the foreign owner, refuse to reacquire, and fence the
/// original fd.
#[tokio::test]
async fn preempted_lock_heal_fences_the_fd() {
    let c = cluster(3, quorum2()).await;
    let gfid = Gfid::new();
    let fd = hold_mandatory_lock(&c, gfid).await;

    c.child_down(2).await;
    c.brick(2)
        .force_posix_lock(gfid, Flock::write(0, 100, LkOwner(0xFE11CE)));
    c.child_up(2).await;

    let set = c.set.clone();
    wait_for(
        || set.lock_heal_queue_sizes() == (0, 0),
        "record dropped after preemption",
    )
    .await;

    let result = c.set.writev(fd, b"zombie write", 0).await;
    assert_eq!(result.err(), Some(Errno::EBADFD), "fenced fd stays dead");
    assert_ne!(
        c.brick(0).contents(gfid),
        b"zombie write",
        "no data reached any replica"
    );
}

/// Losing the lock on enough replicas to fall below quorum fences the fd
/// immediately, with no unlock attempt on the survivors.
#[tokio::test]
async fn lock_below_quorum_fences_without_unlocking() {
    let c = cluster(3, quorum2()).await;
    let gfid = Gfid::new();
    let fd = hold_mandatory_lock(&c, gfid).await;

    c.child_down(2).await;
    c.child_down(1).await;

    assert_eq!(c.set.lock_heal_queue_sizes(), (0, 0), "record dropped");
    assert!(
        c.brick(0).has_posix_lock(gfid, OWNER),
        "survivor keeps the lock for the fencing takeover to preempt"
    );
    let result = c.set.writev(fd, b"x", 0).await;
    assert_eq!(result.err(), Some(Errno::EBADFD));
}

/// A heal that cannot take the heal domain (observed here as brick-side
/// conflicts) leaves the record queued; a later reconnect retries it.
#[tokio::test]
async fn dom_lock_quorum_miss_requeues_record() {
    let c = cluster(3, quorum2()).await;
    let gfid = Gfid::new();
    let fd = hold_mandatory_lock(&c, gfid).await;

    c.child_down(2).await;
    for brick in &c.bricks {
        brick.fail_op("finodelk", Errno::EAGAIN);
    }
    c.child_up(2).await;

    let set = c.set.clone();
    wait_for(
        || set.lock_heal_queue_sizes() == (0, 1),
        "record parked on the heal queue",
    )
    .await;
    assert_eq!(c.set.lock_heal_nodes(fd).expect("record").bits(), 0b011);

    for brick in &c.bricks {
        brick.clear_fail_op("finodelk");
    }
    c.child_down(2).await;
    c.child_up(2).await;
    let set = c.set.clone();
    wait_for(
        || set.lock_heal_queue_sizes() == (1, 0),
        "record healed on retry",
    )
    .await;
    assert_eq!(c.set.lock_heal_nodes(fd).expect("record").bits(), 0b111);
}

#[tokio::test]
async fn unlock_removes_the_heal_record() {
    let c = cluster(3, quorum2()).await;
    let gfid = Gfid::new();
    let fd = hold_mandatory_lock(&c, gfid).await;
    assert_eq!(c.set.lock_heal_queue_sizes(), (1, 0));

    c.set
        .lk(
            fd,
            LkCmd::SetLk,
            Flock::write(0, 100, OWNER).unlock_of(),
            Xdata::new(),
        )
        .await
        .expect("unlock");
    assert_eq!(c.set.lock_heal_queue_sizes(), (0, 0));
    assert!(!c.brick(0).has_posix_lock(gfid, OWNER));
}

#[tokio::test]
async fn release_drops_the_heal_record() {
    let c = cluster(3, quorum2()).await;
    let gfid = Gfid::new();
    let fd = hold_mandatory_lock(&c, gfid).await;
    assert_eq!(c.set.lock_heal_queue_sizes(), (1, 0));

    c.set.release(fd);
    assert_eq!(c.set.lock_heal_queue_sizes(), (0, 0));
}

/// Locks taken without mandatory mode are not tracked at all.
#[tokio::test]
async fn advisory_locks_are_not_registered() {
    let c = cluster(3, quorum2()).await;
    let gfid = Gfid::new();
    c.seed_everywhere(gfid, b"x");
    let fd = c.set.open(gfid, Xdata::new()).await.expect("open");
    c.set
        .lk(fd, LkCmd::SetLk, Flock::write(0, 10, OWNER), Xdata::new())
        .await
        .expect("lock");
    assert_eq!(c.set.lock_heal_queue_sizes(), (0, 0));
}
