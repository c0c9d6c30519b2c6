/// Container Storage Interface bindings, limited to the identity and node services.
pub mod csi {
    #![allow(clippy::derive_partial_eq_without_eq)]
    #![allow(clippy::upper_case_acronyms)]
    tonic::include_proto!("csi.v1");
}
