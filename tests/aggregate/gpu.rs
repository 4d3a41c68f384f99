use super::helpers::{device_memory, instrumented_group, run_instrumented};
use allgrad::{Device, Tensor};
use std::collections::HashSet;

#[test]
fn test_gpu_path_matches_cpu_path() {
    run_instrumented(2, |comm, _, backend| {
        let rank = comm.rank();
        let memory = device_memory(&backend);
        let values = vec![(rank + 1) as f32; 8];

        let on_gpu = Tensor::from_f32_on(Device::Gpu(0), &values, &memory).unwrap();
        let on_cpu = Tensor::from_f32(&values);

        comm.aggregate_in_place(&[on_gpu.view()], &HashSet::new())
            .unwrap();
        comm.aggregate_in_place(&[on_cpu.view()], &HashSet::new())
            .unwrap();

        let gpu_result = on_gpu.to_f32_vec().unwrap();
        let cpu_result = on_cpu.to_f32_vec().unwrap();
        assert_eq!(gpu_result, vec![3.0f32; 8]);
        assert_eq!(gpu_result, cpu_result, "rank {rank} paths diverged");
    });
}

#[test]
fn test_gpu_out_of_place_aggregate() {
    run_instrumented(2, |comm, _, backend| {
        let rank = comm.rank();
        let memory = device_memory(&backend);
        let input = Tensor::from_f32_on(Device::Gpu(0), &[(rank + 1) as f32; 4], &memory).unwrap();

        let outputs = comm.aggregate(&[input.view()], &HashSet::new()).unwrap();

        assert_eq!(outputs[0].device(), Device::Gpu(0));
        assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![3.0f32; 4]);
        // Inputs stay as contributed.
        assert_eq!(input.to_f32_vec().unwrap(), vec![(rank + 1) as f32; 4]);
    });
}

#[test]
fn test_mixed_cpu_and_gpu_tensors_in_one_call() {
    run_instrumented(2, |comm, _, backend| {
        let rank = comm.rank();
        let memory = device_memory(&backend);

        let on_cpu = Tensor::from_f32(&[(rank + 1) as f32; 4]);
        let on_gpu =
            Tensor::from_f32_on(Device::Gpu(0), &[10.0 * (rank + 1) as f32; 6], &memory).unwrap();

        let outputs = comm
            .aggregate(&[on_cpu.view(), on_gpu.view()], &HashSet::new())
            .unwrap();

        // Original order and placement, each pair reduced independently.
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].device(), Device::Cpu);
        assert_eq!(outputs[1].device(), Device::Gpu(0));
        assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![3.0f32; 4]);
        // Copy-back finished before the call returned: the device buffer
        // is fully populated.
        assert_eq!(outputs[1].to_f32_vec().unwrap(), vec![30.0f32; 6]);
    });
}

#[test]
fn test_multiple_gpu_tensors_same_device() {
    run_instrumented(3, |comm, _, backend| {
        let rank = comm.rank();
        let memory = device_memory(&backend);

        let a = Tensor::from_f32_on(Device::Gpu(0), &[rank as f32; 2], &memory).unwrap();
        let b = Tensor::from_f32_on(Device::Gpu(0), &[2.0 * rank as f32; 3], &memory).unwrap();

        comm.aggregate_in_place(&[a.view(), b.view()], &HashSet::new())
            .unwrap();

        assert_eq!(a.to_f32_vec().unwrap(), vec![3.0f32; 2]);
        assert_eq!(b.to_f32_vec().unwrap(), vec![6.0f32; 3]);
    });
}

#[test]
fn test_staging_buffers_reused_across_calls() {
    // Second call needs a bigger buffer; first fits in the grown one.
    run_instrumented(2, |comm, _, backend| {
        let rank = comm.rank();
        let memory = device_memory(&backend);

        let small = Tensor::from_f32_on(Device::Gpu(0), &[(rank + 1) as f32; 4], &memory).unwrap();
        comm.aggregate_in_place(&[small.view()], &HashSet::new())
            .unwrap();
        assert_eq!(small.to_f32_vec().unwrap(), vec![3.0f32; 4]);

        let large =
            Tensor::from_f32_on(Device::Gpu(0), &[(rank + 1) as f32; 64], &memory).unwrap();
        comm.aggregate_in_place(&[large.view()], &HashSet::new())
            .unwrap();
        assert_eq!(large.to_f32_vec().unwrap(), vec![3.0f32; 64]);

        let again = Tensor::from_f32_on(Device::Gpu(0), &[(rank + 1) as f32; 8], &memory).unwrap();
        comm.aggregate_in_place(&[again.view()], &HashSet::new())
            .unwrap();
        assert_eq!(again.to_f32_vec().unwrap(), vec![3.0f32; 8]);
    });
}

#[test]
fn test_single_worker_gpu_identity() {
    let group = instrumented_group(1);
    let (comm, transport, backend) = &group[0];
    let memory = device_memory(backend);

    let input = Tensor::from_f32_on(Device::Gpu(0), &[7.0, 8.0, 9.0], &memory).unwrap();
    let outputs = comm.aggregate(&[input.view()], &HashSet::new()).unwrap();

    assert_eq!(outputs[0].device(), Device::Gpu(0));
    assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![7.0, 8.0, 9.0]);
    assert_eq!(transport.issued_ops(), 0);
}
