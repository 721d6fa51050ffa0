//! Typed ID definitions.
//!
//! Each ID type has a unique prefix that identifies the resource type.

use crate::define_id;

define_id!(MachineId, "machine");
define_id!(InstanceId, "inst");
define_id!(SnapshotId, "snap");

// =============================================================================
// Tests
// =============================================================================
