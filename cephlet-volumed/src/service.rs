//! VolumeRuntime gRPC service implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use cephlet_proto::{
    CreateVolumeRequest, CreateVolumeResponse, DeleteVolumeRequest, DeleteVolumeResponse,
    EncryptionSpec, ExpandVolumeRequest, ExpandVolumeResponse, ListVolumeClassesRequest,
    ListVolumeClassesResponse, ListVolumesRequest, ListVolumesResponse, ObjectMetadata,
    VersionRequest, VersionResponse, VolumeFilter, VolumeResources, VolumeRuntime,
    VolumeStatus,
};
use cephlet_volume::{
    ListFilter, Volume, VolumeAccess, VolumeClass, VolumeError, VolumeManager, VolumeSpec,
    VolumeState,
};

/// Name reported by the Version RPC.
pub const RUNTIME_NAME: &str = "cephlet-volume";

/// VolumeRuntime gRPC service implementation.
pub struct VolumeRuntimeService {
    manager: Arc<VolumeManager>,
}

impl VolumeRuntimeService {
    pub fn new(manager: Arc<VolumeManager>) -> Self {
        Self { manager }
    }
}

/// Map a runtime error to the gRPC status returned to callers.
pub fn status_from_error(err: VolumeError) -> Status {
    let message = err.to_string();
    match err {
        VolumeError::InvalidArgument(_) | VolumeError::ShrinkNotSupported { .. } => {
            Status::invalid_argument(message)
        }
        VolumeError::ClassNotFound(_) | VolumeError::NotFound(_) => Status::not_found(message),
        VolumeError::AlreadyExists(_) => Status::already_exists(message),
        VolumeError::InvalidState(_) => Status::failed_precondition(message),
        VolumeError::Unavailable(_) | VolumeError::KeyUnavailable(_) => {
            Status::unavailable(message)
        }
        VolumeError::CorruptMetadata { .. } => Status::data_loss(message),
        VolumeError::CryptoFailure(_) | VolumeError::Internal(_) => Status::internal(message),
    }
}

fn state_to_proto(state: VolumeState) -> cephlet_proto::VolumeState {
    match state {
        VolumeState::Pending => cephlet_proto::VolumeState::VolumePending,
        VolumeState::Available => cephlet_proto::VolumeState::VolumeAvailable,
        VolumeState::Error => cephlet_proto::VolumeState::VolumeError,
        VolumeState::Deleting => cephlet_proto::VolumeState::VolumeDeleting,
    }
}

fn access_to_proto(access: VolumeAccess) -> cephlet_proto::VolumeAccess {
    cephlet_proto::VolumeAccess {
        driver: access.driver,
        handle: access.handle,
        attributes: access.attributes,
        secret_data: access.secret_data,
    }
}

fn class_to_proto(class: &VolumeClass) -> cephlet_proto::VolumeClass {
    cephlet_proto::VolumeClass {
        name: class.name.clone(),
        capabilities: Some(cephlet_proto::VolumeClassCapabilities {
            tps: class.capabilities.tps,
            iops: class.capabilities.iops,
        }),
    }
}

fn volume_to_proto(volume: Volume) -> cephlet_proto::Volume {
    let state = state_to_proto(volume.state);
    cephlet_proto::Volume {
        metadata: Some(ObjectMetadata {
            id: volume.id,
            annotations: volume.annotations,
            labels: volume.labels,
            generation: volume.generation,
            created_at: volume.created_at.timestamp_nanos_opt().unwrap_or_default(),
            deleted_at: 0,
        }),
        spec: Some(cephlet_proto::VolumeSpec {
            image: volume.image_ref.unwrap_or_default(),
            class: volume.class_name,
            resources: Some(VolumeResources {
                storage_bytes: volume.size_bytes,
            }),
            encryption: volume.encryption.map(|_| EncryptionSpec::default()),
        }),
        status: Some(VolumeStatus {
            state: state as i32,
            access: volume.access.map(access_to_proto),
        }),
    }
}

/// Build the create spec from a requested volume.
fn spec_from_proto(volume: Option<cephlet_proto::Volume>) -> Result<VolumeSpec, Status> {
    let volume = volume.ok_or_else(|| Status::invalid_argument("volume is required"))?;
    let metadata = volume
        .metadata
        .ok_or_else(|| Status::invalid_argument("volume metadata is required"))?;
    let spec = volume
        .spec
        .ok_or_else(|| Status::invalid_argument("volume spec is required"))?;

    let size_bytes = spec.resources.map(|r| r.storage_bytes).unwrap_or_default();
    let mut result = VolumeSpec::new(metadata.id, spec.class, size_bytes);
    result.labels = metadata.labels;
    result.annotations = metadata.annotations;
    result.encryption = spec.encryption.is_some();
    if !spec.image.is_empty() {
        result.image = Some(spec.image);
    }
    Ok(result)
}

fn filter_from_proto(filter: Option<VolumeFilter>) -> ListFilter {
    let Some(filter) = filter else {
        return ListFilter::all();
    };
    ListFilter {
        id: (!filter.id.is_empty()).then_some(filter.id),
        id_prefix: None,
        labels: filter.label_selector,
    }
}

#[tonic::async_trait]
impl VolumeRuntime for VolumeRuntimeService {
    #[instrument(skip(self, request))]
    async fn version(
        &self,
        request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        debug!(client_version = %request.get_ref().version, "Version requested");
        Ok(Response::new(VersionResponse {
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn list_volume_classes(
        &self,
        _request: Request<ListVolumeClassesRequest>,
    ) -> Result<Response<ListVolumeClassesResponse>, Status> {
        let volume_classes = self
            .manager
            .list_volume_classes()
            .iter()
            .map(class_to_proto)
            .collect();

        Ok(Response::new(ListVolumeClassesResponse { volume_classes }))
    }

    #[instrument(skip(self, request))]
    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let filter = filter_from_proto(request.into_inner().filter);

        let volumes = self
            .manager
            .list_volumes(&filter)
            .await
            .map_err(status_from_error)?
            .into_iter()
            .map(volume_to_proto)
            .collect();

        Ok(Response::new(ListVolumesResponse { volumes }))
    }

    #[instrument(skip(self, request))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let spec = spec_from_proto(request.into_inner().volume)?;

        let volume = self.manager.create_volume(spec).await.map_err(|e| {
            warn!(error = %e, "CreateVolume failed");
            status_from_error(e)
        })?;

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(volume_to_proto(volume)),
        }))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().volume_id))]
    async fn expand_volume(
        &self,
        request: Request<ExpandVolumeRequest>,
    ) -> Result<Response<ExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let size_bytes = req.resources.map(|r| r.storage_bytes).unwrap_or_default();

        self.manager
            .expand_volume(&req.volume_id, size_bytes)
            .await
            .map_err(status_from_error)?;

        Ok(Response::new(ExpandVolumeResponse {}))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }

        self.manager
            .delete_volume(&req.volume_id)
            .await
            .map_err(status_from_error)?;

        Ok(Response::new(DeleteVolumeResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use cephlet_volume::{
        MemoryStore, MockProvisioner, StaticKeyManager, VolumeClassSet, CLASS_LABEL,
    };
    use tonic::Code;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn service() -> VolumeRuntimeService {
        let classes = VolumeClassSet::new(vec![
            VolumeClass::new("foo", 100, 100),
            VolumeClass::new("bar", 10, 10),
        ])
        .unwrap();
        let manager = VolumeManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockProvisioner::new()),
            Arc::new(StaticKeyManager::default()),
            Arc::new(classes),
        );
        VolumeRuntimeService::new(Arc::new(manager))
    }

    fn create_request(id: &str, class: &str, size: u64) -> Request<CreateVolumeRequest> {
        Request::new(CreateVolumeRequest {
            volume: Some(cephlet_proto::Volume {
                metadata: Some(ObjectMetadata {
                    id: id.to_string(),
                    labels: HashMap::from([("team".to_string(), "storage".to_string())]),
                    ..Default::default()
                }),
                spec: Some(cephlet_proto::VolumeSpec {
                    class: class.to_string(),
                    resources: Some(VolumeResources {
                        storage_bytes: size,
                    }),
                    ..Default::default()
                }),
                status: None,
            }),
        })
    }

    async fn wait_available(service: &VolumeRuntimeService, id: &str) -> cephlet_proto::Volume {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let volumes = service
                    .list_volumes(Request::new(ListVolumesRequest {
                        filter: Some(VolumeFilter {
                            id: id.to_string(),
                            ..Default::default()
                        }),
                    }))
                    .await
                    .unwrap()
                    .into_inner()
                    .volumes;
                if let Some(volume) = volumes.into_iter().next() {
                    if volume.status.as_ref().unwrap().state()
                        == cephlet_proto::VolumeState::VolumeAvailable
                    {
                        return volume;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_version() {
        let response = service()
            .version(Request::new(VersionRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.runtime_name, RUNTIME_NAME);
        assert!(!response.runtime_version.is_empty());
    }

    #[tokio::test]
    async fn test_list_volume_classes_in_order() {
        let classes = service()
            .list_volume_classes(Request::new(ListVolumeClassesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .volume_classes;

        let names: Vec<_> = classes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["foo", "bar"]);
        assert_eq!(classes[0].capabilities.as_ref().unwrap().iops, 100);
    }

    #[tokio::test]
    async fn test_create_volume() {
        let service = service();
        let volume = service
            .create_volume(create_request("vol-1", "foo", GIB))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();

        let status = volume.status.unwrap();
        assert_eq!(status.state(), cephlet_proto::VolumeState::VolumePending);
        assert!(status.access.is_none());

        let metadata = volume.metadata.unwrap();
        assert_eq!(metadata.id, "vol-1");
        assert_eq!(metadata.labels.get(CLASS_LABEL).map(String::as_str), Some("foo"));
        assert_eq!(metadata.labels.get("team").map(String::as_str), Some("storage"));

        let volume = wait_available(&service, "vol-1").await;
        let access = volume.status.unwrap().access.unwrap();
        assert_eq!(access.handle, "mock/vol-1");
    }

    #[tokio::test]
    async fn test_create_volume_errors() {
        let service = service();

        let status = service
            .create_volume(Request::new(CreateVolumeRequest { volume: None }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = service
            .create_volume(create_request("vol-1", "unknown", GIB))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = service
            .create_volume(create_request("vol-1", "foo", 0))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        service
            .create_volume(create_request("vol-1", "foo", GIB))
            .await
            .unwrap();
        let status = service
            .create_volume(create_request("vol-1", "bar", GIB))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_expand_and_delete() {
        let service = service();
        service
            .create_volume(create_request("vol-1", "foo", GIB))
            .await
            .unwrap();
        wait_available(&service, "vol-1").await;

        service
            .expand_volume(Request::new(ExpandVolumeRequest {
                volume_id: "vol-1".to_string(),
                resources: Some(VolumeResources {
                    storage_bytes: 2 * GIB,
                }),
            }))
            .await
            .unwrap();

        let status = service
            .expand_volume(Request::new(ExpandVolumeRequest {
                volume_id: "vol-1".to_string(),
                resources: Some(VolumeResources { storage_bytes: GIB }),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = service
            .expand_volume(Request::new(ExpandVolumeRequest {
                volume_id: "missing".to_string(),
                resources: Some(VolumeResources { storage_bytes: GIB }),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        service
            .delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: "vol-1".to_string(),
            }))
            .await
            .unwrap();
        // Deleting again is fine
        service
            .delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: "vol-1".to_string(),
            }))
            .await
            .unwrap();

        let volumes = service
            .list_volumes(Request::new(ListVolumesRequest::default()))
            .await
            .unwrap()
            .into_inner()
            .volumes;
        assert!(volumes.is_empty());
    }

    #[tokio::test]
    async fn test_list_volumes_by_label() {
        let service = service();
        service
            .create_volume(create_request("vol-1", "foo", GIB))
            .await
            .unwrap();
        service
            .create_volume(create_request("vol-2", "bar", GIB))
            .await
            .unwrap();

        let volumes = service
            .list_volumes(Request::new(ListVolumesRequest {
                filter: Some(VolumeFilter {
                    label_selector: HashMap::from([(CLASS_LABEL.to_string(), "bar".to_string())]),
                    ..Default::default()
                }),
            }))
            .await
            .unwrap()
            .into_inner()
            .volumes;

        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].metadata.as_ref().unwrap().id, "vol-2");
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (VolumeError::InvalidArgument("x".into()), Code::InvalidArgument),
            (
                VolumeError::ShrinkNotSupported {
                    id: "x".into(),
                    current_bytes: 2,
                    requested_bytes: 1,
                },
                Code::InvalidArgument,
            ),
            (VolumeError::ClassNotFound("x".into()), Code::NotFound),
            (VolumeError::NotFound("x".into()), Code::NotFound),
            (VolumeError::AlreadyExists("x".into()), Code::AlreadyExists),
            (VolumeError::InvalidState("x".into()), Code::FailedPrecondition),
            (VolumeError::Unavailable("x".into()), Code::Unavailable),
            (VolumeError::KeyUnavailable("x".into()), Code::Unavailable),
            (
                VolumeError::CorruptMetadata {
                    id: "x".into(),
                    reason: "y".into(),
                },
                Code::DataLoss,
            ),
            (VolumeError::CryptoFailure("x".into()), Code::Internal),
            (VolumeError::Internal("x".into()), Code::Internal),
        ];

        for (err, code) in cases {
            assert_eq!(status_from_error(err).code(), code);
        }
    }

    #[test]
    fn test_filter_conversion() {
        assert_eq!(filter_from_proto(None), ListFilter::all());
        assert_eq!(
            filter_from_proto(Some(VolumeFilter {
                id: "vol-1".to_string(),
                ..Default::default()
            })),
            ListFilter::by_id("vol-1")
        );
    }
}
