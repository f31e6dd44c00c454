pub mod alphabet;
pub mod factor;
pub mod fizzbuzz;
