#![no_main]

//! Fuzz target for coordinator configuration parsing.
//!
//! Arbitrary YAML must either be rejected or produce a config whose rate
//! limit table answers every operation class with a usable policy.

use authcoord::CoordinatorConfig;
use authcoord::rate_limit::operation;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = CoordinatorConfig::from_yaml_str(text) else {
        return;
    };

    for op in [
        operation::LOGIN,
        operation::SIGNUP,
        operation::PASSWORD_RESET,
        operation::TOKEN_CHECK,
        "unknown",
    ] {
        let policy = config.rate_limit.table.get(op);
        assert!(policy.max_attempts > 0, "validated policy for {op} allows nothing");
    }
    assert!(config.retry.max_attempts > 0);
    assert!(!config.readiness.poll_interval.is_zero());
});
