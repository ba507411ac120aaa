pub mod api;
pub mod controllers;
pub mod hakeeper;
pub mod reconciler;
pub mod util;

#[cfg(test)]
pub mod tests;
