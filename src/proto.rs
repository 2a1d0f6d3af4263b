//! Generated `google.spanner.v1` messages and client, compiled from the vendored protos under `proto/`.

pub mod google {
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
    pub mod spanner {
        pub mod v1 {
            tonic::include_proto!("google.spanner.v1");
        }
    }
}
