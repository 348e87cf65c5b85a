use proptest::prelude::*;

/// Broker entity names: dot-free so delayed queue names split unambiguously
pub fn entity_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,31}"
}

/// Delays from one millisecond up to one day
pub fn delay_ms_strategy() -> impl Strategy<Value = i64> {
    1i64..86_400_000
}

/// Priorities including negative values
pub fn priority_strategy() -> impl Strategy<Value = i64> {
    -100i64..100
}

/// Sequences of job priorities in insertion order
pub fn priority_sequence_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(priority_strategy(), 1..64)
}
