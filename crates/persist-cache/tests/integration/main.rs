mod async_function;
mod async_generator;
mod function;
mod generator;
mod management;
mod utils;
