//! Built-in environments for mbrl.
//!
//! Provides continuous-control environments for testing and benchmarking:
//! - `Pendulum` - Torque-limited swing-up
//! - `PointMass` - Planar point driven to the origin
//! - `ConstantReward` - Unit reward for a fixed number of steps

mod constant_reward;
mod pendulum;
mod point_mass;

pub use constant_reward::ConstantReward;
pub use pendulum::Pendulum;
pub use point_mass::PointMass;

use mbrl::env::MbEnv;

/// Names accepted by `factory` and `make`
pub const ENV_NAMES: &[&str] = &["pendulum", "point_mass", "constant_reward"];

pub type EnvFactory = fn() -> Box<dyn MbEnv>;

/// Constructor for the environment registered under `name`
pub fn factory(name: &str) -> Option<EnvFactory> {
    let f: EnvFactory = match name {
        "pendulum" => || Box::new(Pendulum::new()),
        "point_mass" => || Box::new(PointMass::new()),
        "constant_reward" => || Box::new(ConstantReward::default()),
        _ => return None,
    };
    Some(f)
}

/// Build a boxed environment by name
pub fn make(name: &str) -> Option<Box<dyn MbEnv>> {
    factory(name).map(|f| f())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_known_names() {
        for name in ENV_NAMES {
            let env = make(name).unwrap();
            assert_eq!(env.name(), *name);
        }
        assert!(make("cartpole").is_none());
    }
}
