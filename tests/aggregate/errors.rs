use super::helpers::{device_memory, instrumented_group};
use allgrad::{AllgradError, Communicator, DataType, Device, StorageFormat, Tensor, TensorView};
use std::collections::HashSet;

#[test]
fn test_sparse_input_rejected_before_transport() {
    // World size 2 so the fast exit does not mask validation; only this
    // rank calls — the error must fire before any collective is issued.
    let group = instrumented_group(2);
    let (comm, transport, _) = &group[0];

    let dense = Tensor::from_f32(&[1.0; 4]);
    let sparse = unsafe {
        TensorView::new(
            dense.view().data_ptr(),
            4,
            DataType::F32,
            Device::Cpu,
            StorageFormat::Sparse,
        )
    };

    let err = comm.aggregate(&[sparse], &HashSet::new()).unwrap_err();
    assert!(matches!(err, AllgradError::SparseNotSupported { index: 0 }));
    assert_eq!(transport.issued_ops(), 0);

    let err = comm
        .aggregate_in_place(&[sparse], &HashSet::new())
        .unwrap_err();
    assert!(matches!(err, AllgradError::SparseNotSupported { index: 0 }));
    assert_eq!(transport.issued_ops(), 0);
}

#[test]
fn test_unsupported_dtype_rejected_before_transport() {
    let group = instrumented_group(2);
    let (comm, transport, _) = &group[0];

    let raw = [0u8; 8];
    let half = unsafe {
        TensorView::new(
            raw.as_ptr() as u64,
            4,
            DataType::F16,
            Device::Cpu,
            StorageFormat::Dense,
        )
    };

    let err = comm.aggregate(&[half], &HashSet::new()).unwrap_err();
    assert!(matches!(
        err,
        AllgradError::UnsupportedDType {
            dtype: DataType::F16,
            ..
        }
    ));
    assert_eq!(transport.issued_ops(), 0);
}

#[test]
fn test_mixed_gpu_devices_rejected() {
    let group = instrumented_group(2);
    let (comm, transport, backend) = &group[0];
    let memory = device_memory(backend);

    let a = Tensor::from_f32_on(Device::Gpu(0), &[1.0; 4], &memory).unwrap();
    let b = Tensor::from_f32_on(Device::Gpu(1), &[2.0; 4], &memory).unwrap();

    let err = comm
        .aggregate_in_place(&[a.view(), b.view()], &HashSet::new())
        .unwrap_err();
    assert!(matches!(
        err,
        AllgradError::MixedGpuDevices {
            first: 0,
            second: 1
        }
    ));
    assert_eq!(transport.issued_ops(), 0);
}

#[test]
fn test_sub_group_always_fails() {
    let comms = Communicator::local(1).unwrap();
    let comm = &comms[0];

    let err = comm.sub_group(&HashSet::new()).unwrap_err();
    assert!(matches!(
        err,
        AllgradError::NotImplemented {
            operation: "sub_group"
        }
    ));
    let err = comm.sub_group(&comm.workers()).unwrap_err();
    assert!(matches!(err, AllgradError::NotImplemented { .. }));
}

#[test]
fn test_concatenate_always_fails() {
    let comms = Communicator::local(1).unwrap();
    let comm = &comms[0];

    let err = comm.concatenate(&[], &HashSet::new()).unwrap_err();
    assert!(matches!(
        err,
        AllgradError::NotImplemented {
            operation: "concatenate"
        }
    ));

    let t = Tensor::from_f32(&[1.0]);
    let err = comm
        .concatenate(&[t.view()], &comm.workers())
        .unwrap_err();
    assert!(matches!(err, AllgradError::NotImplemented { .. }));
}

#[test]
fn test_quantized_aggregate_always_fails() {
    let comms = Communicator::local(1).unwrap();
    let comm = &comms[0];

    let err = comm
        .quantized_aggregate(&[], &[], &HashSet::new())
        .unwrap_err();
    assert!(matches!(
        err,
        AllgradError::NotImplemented {
            operation: "quantized_aggregate"
        }
    ));

    let values = Tensor::from_f32(&[1.0, 2.0]);
    let residues = Tensor::from_f32(&[0.0, 0.0]);
    let err = comm
        .quantized_aggregate(&[values.view()], &[residues.view()], &comm.workers())
        .unwrap_err();
    assert!(matches!(err, AllgradError::NotImplemented { .. }));
}
