pub mod routing_benchmark;
