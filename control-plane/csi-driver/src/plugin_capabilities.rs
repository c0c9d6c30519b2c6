use rpc::csi::{
    plugin_capability::{
        service::Type as PluginServiceType, Service, Type::Service as ServiceCapability,
    },
    PluginCapability,
};

/// This returns the exhaustive set of capabilities for this CSI driver.
/// Volume expansion is not advertised as the node plugin cannot grow a filesystem.
pub fn plugin_capabilities() -> Vec<PluginCapability> {
    let service_capabilities = &[PluginServiceType::ControllerService];

    service_capabilities
        .iter()
        .map(|c| PluginCapability {
            r#type: Some(ServiceCapability(Service { r#type: *c as i32 })),
        })
        .collect()
}
