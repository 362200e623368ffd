//! Ways of handing the master password to `bw unlock`.
//!
//! Shells and platforms disagree on argument quoting, so unlock tries each
//! strategy in order until one yields a session key. A strategy is a pure
//! function from the password to the CLI argument vector; new strategies are
//! added to [`default_strategies`] without touching the unlock loop.

/// One way of building the `unlock` argument vector
#[derive(Clone, Copy)]
pub struct DeliveryStrategy {
    pub name: &'static str,
    pub build: fn(&str) -> Vec<String>,
}

impl DeliveryStrategy {
    pub fn args(&self, password: &str) -> Vec<String> {
        (self.build)(password)
    }
}

impl std::fmt::Debug for DeliveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStrategy").field("name", &self.name).finish()
    }
}

pub const UNQUOTED: DeliveryStrategy = DeliveryStrategy {
    name: "unquoted",
    build: |password: &str| unlock_args(password.to_string()),
};

pub const SINGLE_QUOTED: DeliveryStrategy = DeliveryStrategy {
    name: "single-quoted",
    build: |password: &str| unlock_args(format!("'{password}'")),
};

pub const DOUBLE_QUOTED: DeliveryStrategy = DeliveryStrategy {
    name: "double-quoted",
    build: |password: &str| unlock_args(format!("\"{password}\"")),
};

/// Strategies in the order they are tried
pub fn default_strategies() -> Vec<DeliveryStrategy> {
    vec![UNQUOTED, SINGLE_QUOTED, DOUBLE_QUOTED]
}

fn unlock_args(password_arg: String) -> Vec<String> {
    vec!["unlock".to_string(), password_arg, "--raw".to_string()]
}
