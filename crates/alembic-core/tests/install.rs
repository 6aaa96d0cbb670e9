//! Install-time static checks: shadowing, indeterminism, nonlinearity,
//! binding discipline.

use alembic_core::{ChemError, Emitter, ReactionDef, SiteBuilder};
use alembic_sync::Pool;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn identical_reactions_are_rejected() {
    init_logging();
    let pool = Pool::fixed("install-shadow", 1);
    let a = Emitter::<i64>::new("a");

    let error = SiteBuilder::new("shadowed", &pool)
        .reaction(ReactionDef::builder("one").input(a.wildcard()).body(|_| Ok(())))
        .reaction(ReactionDef::builder("two").input(a.wildcard()).body(|_| Ok(())))
        .install()
        .expect_err("identical repeated reactions must be rejected");
    assert!(matches!(error, ChemError::ShadowedReactions(_)));

    pool.shutdown_now();
}

#[test]
fn irrefutably_weaker_pattern_is_unavoidable_indeterminism() {
    init_logging();
    let pool = Pool::fixed("install-weaker", 1);
    let a = Emitter::<i64>::new("a");

    let error = SiteBuilder::new("livelocked", &pool)
        .reaction(ReactionDef::builder("any").input(a.var("x")).body(|_| Ok(())))
        .reaction(ReactionDef::builder("five").input(a.constant(5)).body(|_| Ok(())))
        .install()
        .expect_err("a(x) shadows a(=5): the constant reaction can never win");
    assert!(matches!(error, ChemError::UnavoidableIndeterminism { .. }));

    pool.shutdown_now();
}

#[test]
fn unflagged_repeated_input_is_rejected() {
    init_logging();
    let pool = Pool::fixed("install-nonlinear", 1);
    let a = Emitter::<i64>::new("a");

    let error = SiteBuilder::new("nonlinear", &pool)
        .reaction(
            ReactionDef::builder("pair")
                .input(a.wildcard())
                .input(a.wildcard())
                .body(|_| Ok(())),
        )
        .install()
        .expect_err("repeated inputs need the explicit flag");
    assert!(matches!(error, ChemError::NonlinearInput { .. }));

    pool.shutdown_now();
}

#[test]
fn flagged_repeated_input_installs_and_fires() {
    init_logging();
    let pool = Pool::fixed_cpu("install-repeated");
    let a = Emitter::<i64>::new("a");
    let pair = alembic_core::BlockingEmitter::<(), i64>::new("pair");

    let _site = SiteBuilder::new("repeated", &pool)
        .reaction(
            ReactionDef::builder("pair-up")
                .allow_repeated_inputs()
                .input(a.var("x"))
                .input(a.var("y"))
                .input(pair.wildcard())
                .body(|ctx| {
                    let x: i64 = ctx.value(0);
                    let y: i64 = ctx.value(1);
                    ctx.reply(2, x + y);
                    Ok(())
                }),
        )
        .install()
        .expect("flagged repeated inputs must install");

    a.emit(10).unwrap();
    a.emit(20).unwrap();
    let sum = pair
        .request_timeout((), std::time::Duration::from_secs(10))
        .unwrap()
        .expect("pair reaction never fired");
    assert_eq!(sum, 30);

    pool.shutdown_now();
}

#[test]
fn emits_after_pool_shutdown_report_an_inactive_site() {
    init_logging();
    let pool = Pool::fixed("install-inactive", 1);
    let a = Emitter::<i64>::new("a");
    let b = Emitter::<()>::new("b");

    let _site = SiteBuilder::new("inactive", &pool)
        .reaction(
            ReactionDef::builder("consume")
                .input(a.var("n"))
                .input(b.wildcard())
                .body(|_| Ok(())),
        )
        .install()
        .expect("site install failed");

    a.emit(1).unwrap();
    pool.shutdown_now();
    let error = a.emit(2).expect_err("the site must be inactive after shutdown");
    assert!(matches!(error, ChemError::SiteInactive(_)));
}

#[test]
fn emitting_an_unbound_molecule_fails() {
    init_logging();
    let loose = Emitter::<u32>::new("loose");
    let error = loose.emit(1).expect_err("unbound emit must fail");
    assert!(matches!(error, ChemError::MoleculeNotBound(_)));
}

#[test]
fn a_molecule_binds_to_at_most_one_site() {
    init_logging();
    let pool = Pool::fixed("install-rebind", 1);
    let x = Emitter::<i64>::new("x");
    let y = Emitter::<i64>::new("y");

    let _first = SiteBuilder::new("first", &pool)
        .reaction(ReactionDef::builder("eat-x").input(x.wildcard()).body(|_| Ok(())))
        .install()
        .expect("first site install failed");

    let error = SiteBuilder::new("second", &pool)
        .reaction(
            ReactionDef::builder("eat-both")
                .input(x.wildcard())
                .input(y.wildcard())
                .body(|_| Ok(())),
        )
        .install()
        .expect_err("x is already bound elsewhere");
    assert!(matches!(error, ChemError::AlreadyBound { .. }));

    pool.shutdown_now();
}
