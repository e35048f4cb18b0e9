pub use tokio;

pub mod events;
pub mod task;

pub use events::{EventHandler, EventManager};

/// Formats bytes the way frames are traced: `0x0A, 0x02, 0x08`.
pub fn format_as_hex(slice: &[u8]) -> String {
    slice
        .iter()
        .map(|byte| format!("0x{:02X}", byte))
        .collect::<Vec<String>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_as_hex() {
        assert_eq!(format_as_hex(&[]), "");
        assert_eq!(format_as_hex(&[0x0A, 0xFF, 0x00]), "0x0A, 0xFF, 0x00");
    }
}
