//! Kernel handle and launch-geometry validation

use crate::error::{HalError, HalResult};
use crate::native::{KernelId, LaunchGeometry};

/// Uniform-API handle around an opaque back-end kernel
#[derive(Debug, Clone)]
pub struct Kernel {
    pub(crate) id: KernelId,
    name: String,
}

impl Kernel {
    pub fn new(id: KernelId, name: impl Into<String>) -> Self {
        Kernel {
            id,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Validate an ND-range request and derive the native launch geometry.
///
/// `local` must divide `global` in every used dimension; unused dimensions
/// are forced to 1.
pub(crate) fn launch_geometry(
    work_dim: u32,
    global: [usize; 3],
    local: Option<[usize; 3]>,
) -> HalResult<LaunchGeometry> {
    if !(1..=3).contains(&work_dim) {
        return Err(HalError::InvalidValue(format!(
            "work dimension must be 1..=3, got {}",
            work_dim
        )));
    }
    let dims = work_dim as usize;
    let mut grid = [1u32; 3];
    let mut block = [1u32; 3];
    for i in 0..dims {
        if global[i] == 0 {
            return Err(HalError::InvalidValue(format!(
                "global work size is zero in dimension {}",
                i
            )));
        }
        let local_i = match local {
            Some(l) => {
                if l[i] == 0 || global[i] % l[i] != 0 {
                    return Err(HalError::InvalidValue(format!(
                        "local size {} does not divide global size {} in dimension {}",
                        l[i], global[i], i
                    )));
                }
                l[i]
            }
            None => 1,
        };
        grid[i] = (global[i] / local_i) as u32;
        block[i] = local_i as u32;
    }
    Ok(LaunchGeometry { grid, block })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_divides_global_by_local() {
        let geometry = launch_geometry(2, [64, 32, 1], Some([16, 8, 1])).unwrap();
        assert_eq!(geometry.grid, [4, 4, 1]);
        assert_eq!(geometry.block, [16, 8, 1]);
    }

    #[test]
    fn missing_local_defaults_to_one() {
        let geometry = launch_geometry(1, [100, 1, 1], None).unwrap();
        assert_eq!(geometry.grid, [100, 1, 1]);
        assert_eq!(geometry.block, [1, 1, 1]);
    }

    #[test]
    fn rejects_non_dividing_local() {
        assert!(matches!(
            launch_geometry(1, [10, 1, 1], Some([3, 1, 1])),
            Err(HalError::InvalidValue(_))
        ));
    }

    #[test]
    fn rejects_bad_work_dim_and_zero_global() {
        assert!(launch_geometry(0, [1, 1, 1], None).is_err());
        assert!(launch_geometry(4, [1, 1, 1], None).is_err());
        assert!(launch_geometry(2, [8, 0, 1], None).is_err());
    }
}
