use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result, RpcStatus};
use crate::metadata::Metadata;

// -- Channel credentials ------------------------------------------------------

/// PEM-encoded client identity for mutual TLS.
#[derive(Clone)]
struct Identity {
    private_key: Vec<u8>,
    cert_chain: Vec<u8>,
}

/// Material for a secure channel: optional root CAs (native roots when
/// absent) and an optional client identity.
#[derive(Clone)]
pub(crate) struct SslCredentials {
    root_certs: Option<Vec<u8>>,
    identity: Option<Identity>,
}

enum ChannelKind {
    /// The unique insecure sentinel. Not composable.
    Insecure,
    /// TLS with the given material. Composable.
    Ssl(SslCredentials),
    /// A channel credential with call credentials attached. Sealed: no
    /// further composition.
    Composite {
        channel: ChannelCredentials,
        call: CallCredentials,
    },
}

/// A channel-level credential: the secure/insecure distinction plus any
/// certificate material, possibly with call credentials attached.
///
/// Immutable after creation and freely shareable.
#[derive(Clone)]
pub struct ChannelCredentials {
    inner: Arc<ChannelKind>,
}

impl ChannelCredentials {
    /// The insecure sentinel. Plain TCP, no call credentials permitted.
    pub fn insecure() -> ChannelCredentials {
        ChannelCredentials {
            inner: Arc::new(ChannelKind::Insecure),
        }
    }

    /// A secure credential from PEM material.
    ///
    /// `root_certs` of `None` selects the system's native roots. A client
    /// identity requires both the private key and the certificate chain;
    /// supplying only one is an invalid-argument error.
    pub fn ssl(
        root_certs: Option<&[u8]>,
        private_key: Option<&[u8]>,
        cert_chain: Option<&[u8]>,
    ) -> Result<ChannelCredentials> {
        let identity = match (private_key, cert_chain) {
            (Some(key), Some(chain)) => Some(Identity {
                private_key: key.to_vec(),
                cert_chain: chain.to_vec(),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::InvalidArgument(
                    "private key and certificate chain must be supplied together".into(),
                ))
            }
        };
        Ok(ChannelCredentials {
            inner: Arc::new(ChannelKind::Ssl(SslCredentials {
                root_certs: root_certs.map(|c| c.to_vec()),
                identity,
            })),
        })
    }

    /// Whether call credentials may be attached to this credential.
    pub fn is_composable(&self) -> bool {
        matches!(&*self.inner, ChannelKind::Ssl(_))
    }

    /// Whether this credential carries transport security.
    pub fn is_secure(&self) -> bool {
        !matches!(&*self.inner, ChannelKind::Insecure)
    }

    /// Attach a call credential, producing a sealed composite.
    ///
    /// Only composable credentials accept attachment; the insecure
    /// sentinel and existing composites are rejected.
    pub fn compose(&self, call: CallCredentials) -> Result<ChannelCredentials> {
        if !self.is_composable() {
            return Err(Error::InvalidArgument(
                "channel credential is not composable".into(),
            ));
        }
        Ok(ChannelCredentials {
            inner: Arc::new(ChannelKind::Composite {
                channel: self.clone(),
                call,
            }),
        })
    }

    /// Attach several call credentials at once:
    /// `combine(c, [k1, k2])` is `c.compose(k1.compose(k2))`.
    pub fn combine(
        &self,
        calls: impl IntoIterator<Item = CallCredentials>,
    ) -> Result<ChannelCredentials> {
        let mut iter = calls.into_iter();
        let first = iter.next().ok_or_else(|| {
            Error::InvalidArgument("combine requires at least one call credential".into())
        })?;
        let merged = iter.fold(first, |acc, next| acc.compose(next));
        self.compose(merged)
    }

    /// The call credentials attached via composition, if any.
    pub(crate) fn attached_call_credentials(&self) -> Option<CallCredentials> {
        match &*self.inner {
            ChannelKind::Composite { call, .. } => Some(call.clone()),
            _ => None,
        }
    }

    /// The TLS material backing this credential, if it is secure.
    pub(crate) fn ssl_credentials(&self) -> Option<SslCredentials> {
        match &*self.inner {
            ChannelKind::Insecure => None,
            ChannelKind::Ssl(ssl) => Some(ssl.clone()),
            ChannelKind::Composite { channel, .. } => channel.ssl_credentials(),
        }
    }
}

impl fmt::Debug for ChannelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.inner {
            ChannelKind::Insecure => "Insecure",
            ChannelKind::Ssl(_) => "Ssl",
            ChannelKind::Composite { .. } => "Composite",
        };
        write!(f, "ChannelCredentials({kind})")
    }
}

// -- Call credentials ---------------------------------------------------------

/// Produces per-call metadata from the call's authority URI. May be
/// asynchronous (token fetch, signing).
#[async_trait]
pub trait MetadataGenerator: Send + Sync {
    async fn generate(&self, authority_uri: &str) -> std::result::Result<Metadata, RpcStatus>;
}

enum CallKind {
    Generator(Box<dyn MetadataGenerator>),
    /// Flat list of generators run in order; metadata is concatenated.
    Composite(Vec<CallCredentials>),
}

/// A call-level credential: a metadata generator, or a composition of
/// several. Immutable and freely shareable.
#[derive(Clone)]
pub struct CallCredentials {
    inner: Arc<CallKind>,
}

impl CallCredentials {
    pub fn from_generator(generator: impl MetadataGenerator + 'static) -> CallCredentials {
        CallCredentials {
            inner: Arc::new(CallKind::Generator(Box::new(generator))),
        }
    }

    /// Wrap an async closure `(authority_uri) -> Result<Metadata, RpcStatus>`.
    pub fn from_metadata_fn<F, Fut>(f: F) -> CallCredentials
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Metadata, RpcStatus>> + Send + 'static,
    {
        CallCredentials::from_generator(FnGenerator { f })
    }

    /// The common bearer-token case: emits a single
    /// `authorization: Bearer <token>` entry from the given source.
    pub fn from_access_token_source(source: impl TokenSource + 'static) -> CallCredentials {
        CallCredentials::from_generator(AccessTokenGenerator {
            source: Box::new(source),
        })
    }

    /// Combine two call credentials into one that runs both generators and
    /// concatenates their metadata, preserving order.
    pub fn compose(&self, other: CallCredentials) -> CallCredentials {
        let mut parts = self.parts();
        parts.extend(other.parts());
        CallCredentials {
            inner: Arc::new(CallKind::Composite(parts)),
        }
    }

    fn parts(&self) -> Vec<CallCredentials> {
        match &*self.inner {
            CallKind::Generator(_) => vec![self.clone()],
            CallKind::Composite(list) => list.clone(),
        }
    }

    fn generators(&self) -> Vec<&dyn MetadataGenerator> {
        match &*self.inner {
            CallKind::Generator(g) => vec![g.as_ref()],
            CallKind::Composite(list) => list.iter().flat_map(|c| c.generators()).collect(),
        }
    }

    /// Run every generator in order and merge the results.
    pub(crate) async fn generate(
        &self,
        authority_uri: &str,
    ) -> std::result::Result<Metadata, RpcStatus> {
        let mut metadata = Metadata::new();
        for generator in self.generators() {
            metadata.merge(generator.generate(authority_uri).await?);
        }
        Ok(metadata)
    }
}

impl fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            CallKind::Generator(_) => write!(f, "CallCredentials(Generator)"),
            CallKind::Composite(list) => write!(f, "CallCredentials(Composite x{})", list.len()),
        }
    }
}

struct FnGenerator<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MetadataGenerator for FnGenerator<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Metadata, RpcStatus>> + Send + 'static,
{
    async fn generate(&self, authority_uri: &str) -> std::result::Result<Metadata, RpcStatus> {
        (self.f)(authority_uri.to_string()).await
    }
}

/// An external source of bearer tokens. OAuth acquisition itself lives
/// outside this crate; the contract is "yields a token".
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> std::result::Result<String, RpcStatus>;
}

/// A fixed token, for tests and pre-acquired credentials.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> StaticTokenSource {
        StaticTokenSource {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> std::result::Result<String, RpcStatus> {
        Ok(self.token.clone())
    }
}

struct AccessTokenGenerator {
    source: Box<dyn TokenSource>,
}

#[async_trait]
impl MetadataGenerator for AccessTokenGenerator {
    async fn generate(&self, _authority_uri: &str) -> std::result::Result<Metadata, RpcStatus> {
        let token = self.source.access_token().await?;
        let mut metadata = Metadata::new();
        metadata
            .add("authorization", format!("Bearer {token}"))
            .map_err(|e| RpcStatus::new(crate::error::Code::Internal, e.to_string()))?;
        Ok(metadata)
    }
}

// -- Server credentials -------------------------------------------------------

enum ServerKind {
    Insecure,
    Ssl {
        cert_chain: Vec<u8>,
        private_key: Vec<u8>,
    },
}

/// Server-side transport credentials: plaintext, or TLS with a PEM
/// certificate chain and private key.
#[derive(Clone)]
pub struct ServerCredentials {
    inner: Arc<ServerKind>,
}

impl ServerCredentials {
    pub fn insecure() -> ServerCredentials {
        ServerCredentials {
            inner: Arc::new(ServerKind::Insecure),
        }
    }

    pub fn ssl(cert_chain: &[u8], private_key: &[u8]) -> ServerCredentials {
        ServerCredentials {
            inner: Arc::new(ServerKind::Ssl {
                cert_chain: cert_chain.to_vec(),
                private_key: private_key.to_vec(),
            }),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(&*self.inner, ServerKind::Ssl { .. })
    }

    /// Build the rustls server config; `None` for plaintext.
    pub(crate) fn server_config(&self) -> Result<Option<rustls::ServerConfig>> {
        let (cert_chain, private_key) = match &*self.inner {
            ServerKind::Insecure => return Ok(None),
            ServerKind::Ssl {
                cert_chain,
                private_key,
            } => (cert_chain, private_key),
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let certs = certs_from_pem(cert_chain)?;
        let key = private_key_from_pem(private_key)?;

        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::InvalidArgument(format!("failed to configure TLS: {e}")))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| {
                Error::InvalidArgument(format!("failed to configure server certificate: {e}"))
            })?;
        Ok(Some(config))
    }
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.inner {
            ServerKind::Insecure => "Insecure",
            ServerKind::Ssl { .. } => "Ssl",
        };
        write!(f, "ServerCredentials({kind})")
    }
}

// -- rustls config construction -----------------------------------------------

impl SslCredentials {
    /// Build a rustls client config from this material: custom roots when
    /// supplied, native roots otherwise, plus the optional client identity.
    pub(crate) fn client_config(&self) -> Result<rustls::ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut root_store = rustls::RootCertStore::empty();
        if let Some(ref pem) = self.root_certs {
            for cert in certs_from_pem(pem)? {
                root_store.add(cert).map_err(|e| {
                    Error::InvalidArgument(format!("failed to add root certificate: {e}"))
                })?;
            }
        } else {
            let native_certs = rustls_native_certs::load_native_certs();
            for cert in native_certs.certs {
                root_store.add(cert).ok(); // Ignore individual cert errors
            }
        }

        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::InvalidArgument(format!("failed to configure TLS: {e}")))?
            .with_root_certificates(root_store);

        let config = if let Some(ref identity) = self.identity {
            let certs = certs_from_pem(&identity.cert_chain)?;
            let key = private_key_from_pem(&identity.private_key)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                Error::InvalidArgument(format!("failed to configure client certificate: {e}"))
            })?
        } else {
            builder.with_no_client_auth()
        };

        Ok(config)
    }
}

fn certs_from_pem(pem: &[u8]) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &*pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidArgument(format!("failed to parse certificate: {e}")))
}

fn private_key_from_pem(pem: &[u8]) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &*pem)
        .map_err(|e| Error::InvalidArgument(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| Error::InvalidArgument("no private key found in PEM input".into()))
}
