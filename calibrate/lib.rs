#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod calibration;
pub mod config;
pub mod context;
pub mod data;
pub mod design;
pub mod emulator;
pub mod gp;
pub mod kernel;
pub mod observables;
pub mod output;
pub mod pca;
pub mod sampler;
pub mod seeding;
