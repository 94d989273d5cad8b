pub mod matrix;
pub mod propagate;
pub mod restore;
pub mod run;
pub mod validate;
