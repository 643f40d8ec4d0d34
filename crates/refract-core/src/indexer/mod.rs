pub mod callgraph;
pub mod cycles;
pub mod filesystem;
pub mod graph;
pub mod imports;
pub mod pagerank;
pub mod parser;
pub mod pipeline;
pub mod symbols;
