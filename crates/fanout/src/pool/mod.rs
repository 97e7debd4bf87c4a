pub(crate) mod direct;
pub(crate) mod threads;

#[cfg(unix)]
pub(crate) mod distrib;
#[cfg(unix)]
pub(crate) mod process;
