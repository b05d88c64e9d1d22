#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("LGW_HAL_ERROR: unsupported {param} ({value})")]
    UnsupportedParameter {
        param: &'static str,
        value: u32,
    },
}
