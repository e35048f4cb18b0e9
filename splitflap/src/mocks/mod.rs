//! Mocked transports, used by the tests of this crate and available to others with the `mocks` feature.

pub mod serial_port;
pub mod transport_layer;

use crate::io::{ModuleState, SplitflapState};

/// Builds a state where the modules listed in `homes` have their home sensor active.
pub fn create_test_state(flaps: &[u32], homes: &[usize]) -> SplitflapState {
    SplitflapState {
        modules: flaps
            .iter()
            .enumerate()
            .map(|(i, &flap_index)| ModuleState {
                flap_index,
                sensor_state: homes.contains(&i),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}
