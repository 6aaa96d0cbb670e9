//! The self-deadlock contrast: a body blocking on another molecule of the
//! same site starves on a single-thread fixed pool but completes on a
//! blocking-elastic pool.

use std::time::Duration;

use alembic_core::{BlockingEmitter, Emitter, ReactionDef, SiteBuilder};
use alembic_sync::Pool;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Builds the two-stage site: `outer` blocks on `inner`, whose serving
/// reaction is pinned to the same pool.
fn build_site(pool: &Pool, inner_wait: Duration) -> (Emitter<()>, Emitter<()>, BlockingEmitter<(), i32>) {
    let go = Emitter::<()>::new("go");
    let have = Emitter::<()>::new("have");
    let outer = BlockingEmitter::<(), i32>::new("outer");
    let inner = BlockingEmitter::<(), i32>::new("inner");

    let _site = SiteBuilder::new("two-stage", pool)
        .reaction(
            ReactionDef::builder("outer-stage")
                .input(go.wildcard())
                .input(outer.wildcard())
                .body({
                    let inner = inner.clone();
                    move |ctx| {
                        // Blocks inside the body; on a fixed single-thread
                        // pool nobody is left to serve `inner`.
                        let served = inner.request_timeout((), inner_wait)?;
                        ctx.reply(1, served.unwrap_or(-1));
                        Ok(())
                    }
                }),
        )
        .reaction(
            ReactionDef::builder("inner-stage")
                .input(have.wildcard())
                .input(inner.wildcard())
                .body(|ctx| {
                    ctx.reply(1, 7);
                    Ok(())
                }),
        )
        .install()
        .expect("site install failed");

    (go, have, outer)
}

#[test]
fn fixed_single_thread_pool_self_deadlocks() {
    init_logging();
    let pool = Pool::fixed("deadlock-fixed", 1);
    let (go, have, outer) = build_site(&pool, Duration::from_millis(700));

    have.emit(()).unwrap();
    go.emit(()).unwrap();

    // The lone worker is stuck inside the outer body, so `inner` is never
    // served and the inner wait expires.
    let result = outer
        .request_timeout((), Duration::from_secs(10))
        .unwrap()
        .expect("outer body never replied");
    assert_eq!(result, -1);

    pool.shutdown_now();
}

#[test]
fn blocking_elastic_pool_completes_the_same_program() {
    init_logging();
    let pool = Pool::blocking_elastic("deadlock-elastic", 1);
    let (go, have, outer) = build_site(&pool, Duration::from_secs(10));

    have.emit(()).unwrap();
    go.emit(()).unwrap();

    // The announced blocking call grows the pool by one, so the inner
    // reaction gets a worker and unblocks the outer body.
    let result = outer
        .request_timeout((), Duration::from_secs(15))
        .unwrap()
        .expect("outer body never replied");
    assert_eq!(result, 7);

    pool.shutdown_now();
}
