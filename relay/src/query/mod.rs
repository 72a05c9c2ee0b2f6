pub mod catalog;
pub mod windower;
