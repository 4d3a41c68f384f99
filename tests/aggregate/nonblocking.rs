use super::helpers::{device_memory, instrumented_group};
use allgrad::{Communicator, Device, Tensor};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aggregate_async_two_workers() {
    let comms = Communicator::local(2).unwrap();
    let mut tasks = Vec::new();
    for comm in comms {
        let comm = Arc::new(comm);
        tasks.push(tokio::spawn(async move {
            let rank = comm.rank();
            let input = Tensor::from_f32(&[(rank + 1) as f32; 4]);

            let handle = unsafe { comm.aggregate_async(vec![input.view()], HashSet::new()) };
            let outputs = handle.wait().await.unwrap();

            assert_eq!(outputs.len(), 1);
            assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![3.0f32; 4]);
            assert_eq!(input.to_f32_vec().unwrap(), vec![(rank + 1) as f32; 4]);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aggregate_async_gpu_inputs() {
    let group = instrumented_group(2);
    let mut tasks = Vec::new();
    for (comm, _, backend) in group {
        tasks.push(tokio::spawn(async move {
            let rank = comm.rank();
            let memory = device_memory(&backend);
            let input =
                Tensor::from_f32_on(Device::Gpu(0), &[(rank + 1) as f32; 16], &memory).unwrap();

            let handle = unsafe { comm.aggregate_async(vec![input.view()], HashSet::new()) };
            let outputs = handle.wait().await.unwrap();

            assert_eq!(outputs[0].device(), Device::Gpu(0));
            assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![3.0f32; 16]);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aggregate_async_single_worker() {
    let comms = Communicator::local(1).unwrap();
    let comm = Arc::new(comms.into_iter().next().unwrap());

    let input = Tensor::from_f64(&[1.25, 2.5]);
    let handle = unsafe { comm.aggregate_async(vec![input.view()], HashSet::new()) };
    let outputs = handle.wait().await.unwrap();

    assert_eq!(outputs[0].to_f64_vec().unwrap(), vec![1.25, 2.5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aggregate_async_multiple_tensors() {
    let comms = Communicator::local(2).unwrap();
    let mut tasks = Vec::new();
    for comm in comms {
        let comm = Arc::new(comm);
        tasks.push(tokio::spawn(async move {
            let rank = comm.rank();
            let a = Tensor::from_f32(&[rank as f32; 2]);
            let b = Tensor::from_f32(&[(rank + 1) as f32; 3]);

            let handle =
                unsafe { comm.aggregate_async(vec![a.view(), b.view()], HashSet::new()) };
            let outputs = handle.wait().await.unwrap();

            assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![1.0f32; 2]);
            assert_eq!(outputs[1].to_f32_vec().unwrap(), vec![3.0f32; 3]);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
}
