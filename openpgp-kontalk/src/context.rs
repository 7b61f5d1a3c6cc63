//! The crypto context.

use std::time::{Duration, SystemTime};

use sequoia_openpgp as openpgp;
use openpgp::policy::{Policy, StandardPolicy};

/// How much a message timestamp may differ from the reference time
/// before it is considered drifted.
pub const TIMEDIFF_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// A `&CryptoContext` for every key and coder operation.
///
/// The context is created once at startup and passed to the
/// operations that need it.  It is immutable afterwards.
///
/// # Example
///
/// A context with reasonable defaults can be created using
/// `CryptoContext::new`:
///
/// ```
/// # use kontalk_openpgp::CryptoContext;
/// let ctx = CryptoContext::new("beta.kontalk.net");
/// assert_eq!(ctx.network(), "beta.kontalk.net");
/// ```
///
/// A context can be configured using the builder pattern with
/// `CryptoContext::configure`:
///
/// ```
/// # use std::time::Duration;
/// # use kontalk_openpgp::CryptoContext;
/// let ctx = CryptoContext::configure("beta.kontalk.net")
///     .drift_threshold(Duration::from_secs(3600))
///     .build();
/// assert_eq!(ctx.drift_threshold(), Duration::from_secs(3600));
/// ```
pub struct CryptoContext {
    network: String,
    drift_threshold: Duration,
    reference_time: Option<SystemTime>,
    policy: StandardPolicy<'static>,
}

impl CryptoContext {
    /// Creates a context with reasonable defaults.
    ///
    /// `network` is the domain of the Kontalk network the user
    /// belongs to.  It is used to select and format user IDs.
    pub fn new(network: &str) -> Self {
        Self::configure(network).build()
    }

    /// Creates a context that can be configured.
    ///
    /// The configuration is seeded like in `CryptoContext::new`, but
    /// can be modified.  A configuration has to be finalized using
    /// `.build()` in order to turn it into a context.
    pub fn configure(network: &str) -> Config {
        Config(CryptoContext {
            network: network.into(),
            drift_threshold: TIMEDIFF_THRESHOLD,
            reference_time: None,
            policy: StandardPolicy::new(),
        })
    }

    /// Returns the network domain.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Returns the maximum tolerated timestamp drift.
    pub fn drift_threshold(&self) -> Duration {
        self.drift_threshold
    }

    /// Returns the current time, or the fixed reference time if one
    /// was configured.
    pub fn now(&self) -> SystemTime {
        self.reference_time.unwrap_or_else(SystemTime::now)
    }

    /// Returns the OpenPGP policy.
    pub fn policy(&self) -> &dyn Policy {
        &self.policy
    }

    /// Returns whether `a` and `b` are further apart than the drift
    /// threshold.
    pub fn is_drifted(&self, a: SystemTime, b: SystemTime) -> bool {
        let diff = a.duration_since(b)
            .or_else(|_| b.duration_since(a))
            .unwrap_or_default();
        diff > self.drift_threshold
    }
}

/// Represents a `CryptoContext` configuration.
pub struct Config(CryptoContext);

impl Config {
    /// Finalizes the configuration and returns a `CryptoContext`.
    pub fn build(self) -> CryptoContext {
        self.0
    }

    /// Sets the maximum tolerated timestamp drift.
    pub fn drift_threshold(mut self, threshold: Duration) -> Self {
        self.set_drift_threshold(threshold);
        self
    }

    /// Sets the maximum tolerated timestamp drift.
    pub fn set_drift_threshold(&mut self, threshold: Duration) {
        self.0.drift_threshold = threshold;
    }

    /// Fixes the time used instead of the system clock.
    pub fn reference_time(mut self, time: SystemTime) -> Self {
        self.set_reference_time(time);
        self
    }

    /// Fixes the time used instead of the system clock.
    pub fn set_reference_time(&mut self, time: SystemTime) {
        self.0.reference_time = Some(time);
    }
}
