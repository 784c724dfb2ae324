//! Integration tests for [`mmwave_train::config`].
//!
//! All tests are deterministic: they use only fixed values and the
//! `TrainingConfig::default()` constructor.

use mmwave_train::config::{Activation, Method, TargetContext, TrainingConfig};
use tempfile::tempdir;

// ---------------------------------------------------------------------------
// Default config invariants
// ---------------------------------------------------------------------------

/// The default configuration must pass its own validation.
#[test]
fn default_config_is_valid() {
    let cfg = TrainingConfig::default();
    cfg.validate().expect("default TrainingConfig must be valid");
}

/// Defaults follow the reference experiment settings.
#[test]
fn default_hyperparameters() {
    let cfg = TrainingConfig::default();
    assert_eq!(cfg.epochs, 10000);
    assert_eq!(cfg.batch_size, 64);
    assert_eq!(cfg.num_classes, 10);
    assert_eq!(cfg.train_src_days, 3);
    assert_eq!(cfg.anneal, 4);
    assert_eq!(cfg.save_freq, 25);
    assert_eq!(cfg.method, Method::Cdan);
    assert_eq!(cfg.activation_fn, Activation::Selu);
    assert!((cfg.init_lr - 1e-3).abs() < 1e-12);
    assert!((cfg.s - 10.0).abs() < 1e-12);
    assert!((cfg.m - 0.2).abs() < 1e-12);
    assert!((cfg.dm_lambda - 0.1).abs() < 1e-12);
}

/// Source plus exactly one target gives two domains.
#[test]
fn default_has_two_domains() {
    assert_eq!(TrainingConfig::default().num_domains(), 2);
}

// ---------------------------------------------------------------------------
// Validation failures
// ---------------------------------------------------------------------------

fn assert_invalid(mutate: impl FnOnce(&mut TrainingConfig), what: &str) {
    let mut cfg = TrainingConfig::default();
    mutate(&mut cfg);
    assert!(cfg.validate().is_err(), "{what} must be rejected");
}

#[test]
fn zero_epochs_rejected() {
    assert_invalid(|c| c.epochs = 0, "epochs = 0");
}

#[test]
fn zero_batch_size_rejected() {
    assert_invalid(|c| c.batch_size = 0, "batch_size = 0");
}

#[test]
fn non_positive_learning_rate_rejected() {
    assert_invalid(|c| c.init_lr = 0.0, "init_lr = 0");
    assert_invalid(|c| c.init_lr = -1e-3, "init_lr < 0");
}

#[test]
fn zero_anneal_rejected() {
    assert_invalid(|c| c.anneal = 0, "anneal = 0");
}

#[test]
fn margin_outside_unit_interval_rejected() {
    assert_invalid(|c| c.m = -0.1, "m < 0");
    assert_invalid(|c| c.m = 1.0, "m = 1");
}

#[test]
fn missing_source_days_rejected() {
    assert_invalid(|c| c.train_src_days = 0, "train_src_days = 0");
}

/// Exactly one target set may have training days.
#[test]
fn target_sets_are_mutually_exclusive() {
    assert_invalid(
        |c| {
            c.train_trg_days = 1;
            c.train_con_days = 1;
        },
        "two active targets",
    );
    assert_invalid(|c| c.train_trg_days = 0, "no active target");
}

#[test]
fn zero_target_max_rejected() {
    assert_invalid(|c| c.target_max = Some(0), "target_max = 0");
}

// ---------------------------------------------------------------------------
// Target context
// ---------------------------------------------------------------------------

#[test]
fn target_context_scalar_names() {
    let mut cfg = TrainingConfig::default();
    cfg.train_trg_days = 2;
    assert_eq!(cfg.target_context().unwrap().scalar_name(), "time test acc2");

    cfg.train_trg_days = 0;
    cfg.train_ser_days = 1;
    assert_eq!(cfg.target_context(), Some(TargetContext::Server(1)));
    assert_eq!(cfg.target_context().unwrap().scalar_name(), "server test acc1");

    cfg.train_ser_days = 0;
    cfg.train_con_days = 3;
    assert_eq!(cfg.target_context().unwrap().scalar_name(), "conference test acc3");
}

/// `val` takes precedence over every target set.
#[test]
fn validation_context_wins() {
    let mut cfg = TrainingConfig::default();
    cfg.train_trg_days = 0;
    cfg.train_off_days = 1;
    cfg.val = true;
    assert_eq!(cfg.target_context(), Some(TargetContext::Validation));
    assert_eq!(cfg.target_context().unwrap().scalar_name(), "val");
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Fields absent from a JSON file take their default values.
#[test]
fn partial_json_fills_defaults() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("partial.json");
    std::fs::write(&path, r#"{ "epochs": 12, "method": "CDAN_AMCA" }"#).unwrap();

    let cfg = TrainingConfig::from_json(&path).expect("partial config must load");
    assert_eq!(cfg.epochs, 12);
    assert_eq!(cfg.method, Method::CdanAmca);
    assert_eq!(cfg.batch_size, TrainingConfig::default().batch_size);
}

#[test]
fn malformed_json_is_an_error() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(TrainingConfig::from_json(&path).is_err());
}

/// A file that parses but fails validation is rejected.
#[test]
fn invalid_json_values_rejected() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("invalid.json");
    std::fs::write(&path, r#"{ "anneal": 0 }"#).unwrap();
    assert!(TrainingConfig::from_json(&path).is_err());
}

/// `read_json` defers validation so that later overrides can make a file
/// valid.
#[test]
fn read_json_defers_validation_to_overrides() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("server.json");
    std::fs::write(&path, r#"{ "train_ser_days": 2 }"#).unwrap();

    assert!(TrainingConfig::from_json(&path).is_err(), "two active targets");
    let mut cfg = TrainingConfig::read_json(&path).expect("parses without validation");
    cfg.train_trg_days = 0;
    cfg.validate().expect("one active target after override");
    assert_eq!(cfg.target_context(), Some(TargetContext::Server(2)));
}

#[test]
fn missing_file_is_an_error() {
    let tmp = tempdir().unwrap();
    assert!(TrainingConfig::from_json(&tmp.path().join("nope.json")).is_err());
}

// ---------------------------------------------------------------------------
// Run naming
// ---------------------------------------------------------------------------

/// Changing an identifying hyper-parameter moves the run directory; changing
/// the learning rate does not.
#[test]
fn run_name_tracks_identifying_params() {
    let base = TrainingConfig::default();

    let mut other_method = base.clone();
    other_method.method = Method::CdanE;
    assert_ne!(base.run_name(), other_method.run_name());

    let mut other_lr = base.clone();
    other_lr.init_lr = 5e-4;
    assert_eq!(base.run_name(), other_lr.run_name());
}

#[test]
fn run_name_strips_spaces_from_notes() {
    let mut cfg = TrainingConfig::default();
    cfg.notes = "first try".into();
    assert!(cfg.run_name().ends_with("-notes:firsttry"));
}

/// Separators in the notes never leave the log directory.
#[test]
fn run_name_is_a_single_path_component() {
    let tmp = tempdir().unwrap();
    let mut cfg = TrainingConfig::default();
    cfg.log_dir = tmp.path().to_path_buf();
    cfg.notes = "../../etc/x y\\z".into();

    let name = cfg.run_name();
    assert!(name.ends_with("-notes:.._.._etc_xy_z"), "{name}");
    assert!(!name.contains('/') && !name.contains('\\'));
    assert_eq!(cfg.run_dir().parent(), Some(tmp.path()));
}
