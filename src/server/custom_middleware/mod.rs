pub mod logging_layer;
