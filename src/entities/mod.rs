pub mod device_code;

pub use device_code::Entity as DeviceCode;
