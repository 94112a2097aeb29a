pub mod bootstrap;
pub mod synchronizer;
pub mod tracker;
