mod app;
mod iot_data;

pub use app::app;
