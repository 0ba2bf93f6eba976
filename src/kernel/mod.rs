//! Kernel oracles for the decomposition engine

pub mod combined;
pub mod custom;
pub mod linear;
pub mod rbf;
pub mod traits;

pub use self::combined::*;
pub use self::custom::*;
pub use self::linear::*;
pub use self::rbf::*;
pub use self::traits::*;
