pub mod kolors;
