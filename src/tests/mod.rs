
mod active_dof_test;
mod snapshot_test;
