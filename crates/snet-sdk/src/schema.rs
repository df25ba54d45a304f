//! Runtime compilation of a service's protobuf schema.

use std::collections::BTreeMap;

use prost_reflect::{DescriptorPool, MessageDescriptor, MethodDescriptor};
use protox::file::{ChainFileResolver, File, FileResolver, GoogleFileResolver};
use protox::Compiler;

use crate::{Result, SdkError};

/// File name under which the training schema is injected.
pub const TRAINING_PROTO_NAME: &str = "snet/training.proto";

/// Fully-qualified name of the daemon training service.
pub const TRAINING_SERVICE: &str = "training.Daemon";

const TRAINING_PROTO: &str = include_str!("proto/training.proto");

/// Serves bundle sources by name.
struct BundleResolver {
    files: BTreeMap<String, String>,
}

impl FileResolver for BundleResolver {
    fn open_file(&self, name: &str) -> std::result::Result<File, protox::Error> {
        match self.files.get(name) {
            Some(source) => File::from_source(name, source),
            None => Err(protox::Error::file_not_found(name)),
        }
    }
}

/// A resolved RPC method.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub package: String,
    pub service: String,
    pub method: String,
    pub input: MessageDescriptor,
    pub output: MessageDescriptor,
}

impl MethodInfo {
    fn from_descriptor(method: &MethodDescriptor) -> Self {
        let service = method.parent_service();
        Self {
            package: service.package_name().to_string(),
            service: service.name().to_string(),
            method: method.name().to_string(),
            input: method.input(),
            output: method.output(),
        }
    }

    /// `/package.Service/Method`, the gRPC request path.
    pub fn path(&self) -> String {
        if self.package.is_empty() {
            format!("/{}/{}", self.service, self.method)
        } else {
            format!("/{}.{}/{}", self.package, self.service, self.method)
        }
    }
}

/// Compiled descriptors of a service, shared read-only by every call.
#[derive(Debug, Clone)]
pub struct Schema {
    pool: DescriptorPool,
    /// Files in lookup order: bundle files by name, then injected sources.
    file_order: Vec<String>,
}

impl Schema {
    /// Compile `sources` together with the training schema.
    ///
    /// Well-known `google/protobuf/*` imports resolve automatically. If the
    /// bundle already carries a conflicting training definition, the bundle
    /// is compiled on its own.
    pub fn compile(sources: &BTreeMap<String, String>) -> Result<Self> {
        let mut with_training = sources.clone();
        if !with_training.contains_key(TRAINING_PROTO_NAME) {
            with_training.insert(TRAINING_PROTO_NAME.to_string(), TRAINING_PROTO.to_string());
        }
        match Self::compile_files(with_training) {
            Ok(schema) => Ok(schema),
            Err(e) if !sources.is_empty() => {
                tracing::warn!(error = %e, "compiling with training schema failed, retrying without it");
                Self::compile_files(sources.clone())
            }
            Err(e) => Err(e),
        }
    }

    fn compile_files(files: BTreeMap<String, String>) -> Result<Self> {
        let mut file_order: Vec<String> = files
            .keys()
            .filter(|name| name.as_str() != TRAINING_PROTO_NAME)
            .cloned()
            .collect();
        if files.contains_key(TRAINING_PROTO_NAME) {
            file_order.push(TRAINING_PROTO_NAME.to_string());
        }

        let mut resolver = ChainFileResolver::new();
        resolver.add(BundleResolver { files });
        resolver.add(GoogleFileResolver::new());

        let mut compiler = Compiler::with_file_resolver(resolver);
        compiler.include_imports(true);
        compiler
            .open_files(&file_order)
            .map_err(|e| SdkError::Archive(format!("schema compilation failed: {e}")))?;

        Ok(Self {
            pool: compiler.descriptor_pool(),
            file_order,
        })
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// First method named `name`, scanning files, then services, then methods.
    pub fn find_method(&self, name: &str) -> Result<MethodInfo> {
        self.file_order
            .iter()
            .filter_map(|file| self.pool.get_file_by_name(file))
            .flat_map(|file| file.services().collect::<Vec<_>>())
            .flat_map(|service| service.methods().collect::<Vec<_>>())
            .find(|method| method.name() == name)
            .map(|method| MethodInfo::from_descriptor(&method))
            .ok_or_else(|| SdkError::MethodNotFound(name.to_string()))
    }

    /// A method on a specific service, e.g. `("training.Daemon", "GetModel")`.
    pub fn method(&self, service_full_name: &str, name: &str) -> Result<MethodInfo> {
        self.pool
            .get_service_by_name(service_full_name)
            .and_then(|service| service.methods().find(|m| m.name() == name))
            .map(|method| MethodInfo::from_descriptor(&method))
            .ok_or_else(|| SdkError::MethodNotFound(format!("{service_full_name}/{name}")))
    }

    pub fn message(&self, full_name: &str) -> Result<MessageDescriptor> {
        self.pool
            .get_message_by_name(full_name)
            .ok_or_else(|| SdkError::NotFound(format!("message {full_name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: &str = "syntax=\"proto3\"; package demo; service Greeter { rpc SayHello(HelloRequest) returns (HelloReply); } message HelloRequest{string name=1;} message HelloReply{string message=1;}";

    fn demo_sources() -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        files.insert("demo.proto".to_string(), DEMO.to_string());
        files
    }

    #[test]
    fn test_find_method_in_compiled_schema() {
        let schema = Schema::compile(&demo_sources()).unwrap();
        let m = schema.find_method("SayHello").unwrap();
        assert_eq!(m.package, "demo");
        assert_eq!(m.service, "Greeter");
        assert_eq!(m.input.full_name(), "demo.HelloRequest");
        assert_eq!(m.output.full_name(), "demo.HelloReply");
        assert_eq!(m.path(), "/demo.Greeter/SayHello");
    }

    #[test]
    fn test_training_methods_always_resolvable() {
        let schema = Schema::compile(&demo_sources()).unwrap();
        let m = schema.method(TRAINING_SERVICE, "GetModel").unwrap();
        assert_eq!(m.path(), "/training.Daemon/GetModel");
        assert_eq!(m.input.full_name(), "training.CommonRequest");
        assert!(schema.find_method("GetTrainingMetadata").is_ok());
    }

    #[test]
    fn test_find_method_first_match_by_file_order() {
        let mut files = demo_sources();
        files.insert(
            "a_first.proto".to_string(),
            "syntax=\"proto3\"; package alpha; service Other { rpc SayHello(Req) returns (Req); } message Req{}".to_string(),
        );
        let schema = Schema::compile(&files).unwrap();
        let m = schema.find_method("SayHello").unwrap();
        assert_eq!(m.package, "alpha");
        assert_eq!(m.service, "Other");
    }

    #[test]
    fn test_well_known_imports() {
        let mut files = BTreeMap::new();
        files.insert(
            "svc.proto".to_string(),
            "syntax=\"proto3\"; package svc; import \"google/protobuf/empty.proto\"; service S { rpc Ping(google.protobuf.Empty) returns (google.protobuf.Empty); }".to_string(),
        );
        let schema = Schema::compile(&files).unwrap();
        assert_eq!(schema.find_method("Ping").unwrap().path(), "/svc.S/Ping");
    }

    #[test]
    fn test_missing_method() {
        let schema = Schema::compile(&demo_sources()).unwrap();
        assert!(matches!(
            schema.find_method("Nope"),
            Err(SdkError::MethodNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_source_is_archive_error() {
        let mut files = BTreeMap::new();
        files.insert("bad.proto".to_string(), "syntax = \"proto3\"; message {".to_string());
        assert!(matches!(Schema::compile(&files), Err(SdkError::Archive(_))));
    }
}
