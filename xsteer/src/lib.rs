// Allow the crate to reference itself as ::xsteer for derive macro usage
extern crate self as xsteer;

pub mod map;
pub mod redirect;
pub mod ring;
pub mod rx;
pub mod shmem;
pub mod socket;
pub mod trace;
pub mod types;

#[doc(inline)]
pub use xsteer_derive::ShmSafe;

#[doc(inline)]
pub use shmem::ShmSafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use shmem::ShmSafe as __ShmSafePrivate;

pub use trace::init_tracing;
