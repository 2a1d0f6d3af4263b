use std::io::Result;
fn main() -> Result<()> {
    tonic_build::configure()
        .build_server(false)
        .compile(
            &[
                "rpc/error_details.proto",
                "rpc/status.proto",
                "spanner/v1/commit_response.proto",
                "spanner/v1/keys.proto",
                "spanner/v1/mutation.proto",
                "spanner/v1/result_set.proto",
                "spanner/v1/spanner.proto",
                "spanner/v1/transaction.proto",
                "spanner/v1/type.proto",
            ]
            .iter()
            .map(|&filename| format!("proto/google/{}", filename))
            .collect::<Vec<String>>(),
            &["proto".to_string()],
        )?;
    Ok(())
}
