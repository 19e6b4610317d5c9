use failsafe::backoff::Exponential;
use failsafe::failure_policy::ConsecutiveFailures;
use failsafe::{backoff, failure_policy, Config, StateMachine};
use std::time::Duration;

/// Circuit breaker guarding message-bus publishes.
pub type BusCircuitBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for message-bus publishes so an unreachable bus fails fast
/// instead of stalling every committed write behind a timeout.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// While OPEN, publishes are rejected immediately and the events stay in the outbox
/// until the sweep picks them up.
pub fn create_bus_circuit_breaker() -> BusCircuitBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe::{CircuitBreaker, Error};

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let cb = create_bus_circuit_breaker();

        for _ in 0..5 {
            let result: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("bus unreachable"));
            assert!(result.is_err());
        }

        let result: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));

        match result {
            Err(Error::Rejected) => {}
            _ => panic!("Expected circuit to be open and reject publishes"),
        }
    }

    #[test]
    fn test_circuit_breaker_allows_success() {
        let cb = create_bus_circuit_breaker();

        let result: Result<i32, Error<&str>> = cb.call(|| Ok::<i32, &str>(42));

        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = create_bus_circuit_breaker();

        for _ in 0..4 {
            let _: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("timeout"));
        }
        let _: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));
        for _ in 0..4 {
            let _: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("timeout"));
        }

        assert!(cb.is_call_permitted());
    }
}
