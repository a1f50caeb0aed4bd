//! Capability-probing construction.
//!
//! Provider builds disagree on which argument shapes their creation calls accept. Rather than
//! inspecting the binding, resources are built by trying an ordered list of strategies: a shape
//! rejection moves on to the next one, any other failure stops immediately and is surfaced.
use std::fmt;
use std::sync::Arc;

use rdma::ibv::{
    AccessFlags, CompletionQueue, ProtectionDomain, QpCapability, QpCreateArgs, QpDesc,
    QpInitAttr, QpType, QueuePair, Verbs,
};
use rdma::mr::MemoryRegion;
use rdma::rdmacm::CmId;
use rdma::VerbsError;

use crate::config::CascadeConfig;
use crate::{Error, Result};

/// What a single strategy produced.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    UnsupportedShape(String),
    ProvisioningError(VerbsError),
}

impl<T> Outcome<T> {
    /// Classify a provider result. `Ok(None)` falls back to `side_channel`, for builds that
    /// attach the resource elsewhere instead of returning it.
    pub fn classify(
        result: std::result::Result<Option<T>, VerbsError>,
        side_channel: impl FnOnce() -> Option<T>,
    ) -> Self {
        match result {
            Ok(Some(value)) => Outcome::Success(value),
            Ok(None) => match side_channel() {
                Some(value) => Outcome::Success(value),
                None => Outcome::UnsupportedShape("returned nothing".to_owned()),
            },
            Err(VerbsError::UnsupportedShape(reason)) => Outcome::UnsupportedShape(reason),
            Err(e) => Outcome::ProvisioningError(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    UnsupportedShape(String),
    ProvisioningError(String),
}

/// The record of one strategy tried during construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstructionAttempt {
    pub strategy: &'static str,
    pub shape: String,
    pub result: AttemptResult,
}

impl fmt::Display for ConstructionAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}: ", self.strategy, self.shape)?;
        match &self.result {
            AttemptResult::Success => f.write_str("ok"),
            AttemptResult::UnsupportedShape(reason) => write!(f, "unsupported ({})", reason),
            AttemptResult::ProvisioningError(e) => write!(f, "failed ({})", e),
        }
    }
}

pub(crate) fn display_attempts(attempts: &[ConstructionAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A resource built through the cascade, with the path that produced it.
#[derive(Debug)]
pub struct Constructed<T> {
    pub value: T,
    pub strategy: &'static str,
    pub attempts: Vec<ConstructionAttempt>,
}

/// Drives strategies for one resource and keeps the attempt log.
#[derive(Debug)]
pub struct Cascade {
    resource: &'static str,
    attempts: Vec<ConstructionAttempt>,
}

impl Cascade {
    pub fn new(resource: &'static str) -> Self {
        Cascade {
            resource,
            attempts: Vec::new(),
        }
    }

    #[inline]
    pub fn attempts(&self) -> &[ConstructionAttempt] {
        &self.attempts
    }

    /// Record one strategy. `Ok(Some(_))` means construction is done, `Ok(None)` means try the
    /// next strategy, `Err(_)` means stop.
    pub fn attempt<T>(
        &mut self,
        strategy: &'static str,
        shape: impl fmt::Display,
        outcome: Outcome<T>,
    ) -> Result<Option<Constructed<T>>> {
        match outcome {
            Outcome::Success(value) => Ok(Some(self.succeeded(strategy, shape, value))),
            Outcome::UnsupportedShape(reason) => {
                let shape = shape.to_string();
                tracing::debug!("{}: {}{} unsupported: {}", self.resource, strategy, shape, reason);
                self.attempts.push(ConstructionAttempt {
                    strategy,
                    shape,
                    result: AttemptResult::UnsupportedShape(reason),
                });
                Ok(None)
            }
            Outcome::ProvisioningError(source) => {
                tracing::warn!("{}: {}{} failed: {}", self.resource, strategy, shape, source);
                Err(Error::Provisioning {
                    resource: self.resource,
                    source,
                })
            }
        }
    }

    /// Record a strategy that produced the resource and hand back the finished log.
    pub fn succeeded<T>(
        &mut self,
        strategy: &'static str,
        shape: impl fmt::Display,
        value: T,
    ) -> Constructed<T> {
        let shape = shape.to_string();
        tracing::debug!("{}: {}{} succeeded", self.resource, strategy, shape);
        self.attempts.push(ConstructionAttempt {
            strategy,
            shape,
            result: AttemptResult::Success,
        });
        Constructed {
            value,
            strategy,
            attempts: std::mem::take(&mut self.attempts),
        }
    }

    /// Every strategy was rejected on shape.
    pub fn exhausted(self) -> Error {
        Error::NoConstructionPath {
            resource: self.resource,
            attempts: self.attempts,
        }
    }
}

/// The queue-pair strategies, in the order they are normally tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpStrategy {
    PdAndAttr,
    Attr,
    Pd,
    None,
    AttrNoCap,
    AttrNoCq,
    AttrEmpty,
    ProviderAttr,
    AttrEx,
}

impl QpStrategy {
    pub fn name(self) -> &'static str {
        match self {
            QpStrategy::PdAndAttr => "pd+attr",
            QpStrategy::Attr => "attr",
            QpStrategy::Pd => "pd",
            QpStrategy::None => "none",
            QpStrategy::AttrNoCap => "attr-no-cap",
            QpStrategy::AttrNoCq => "attr-no-cq",
            QpStrategy::AttrEmpty => "attr-empty",
            QpStrategy::ProviderAttr => "provider-attr",
            QpStrategy::AttrEx => "attr-ex",
        }
    }

    fn carries_pd(self) -> bool {
        matches!(
            self,
            QpStrategy::PdAndAttr | QpStrategy::Pd | QpStrategy::AttrEx
        )
    }
}

/// The strategy order for a configuration. `provider_attr` adds the strategy that starts from
/// the connection manager's own attributes.
pub fn qp_strategies(config: &CascadeConfig, provider_attr: bool) -> Vec<QpStrategy> {
    let mut order = vec![
        QpStrategy::PdAndAttr,
        QpStrategy::Attr,
        QpStrategy::Pd,
        QpStrategy::None,
        QpStrategy::AttrNoCap,
        QpStrategy::AttrNoCq,
        QpStrategy::AttrEmpty,
    ];
    if config.attr_first {
        order.swap(0, 1);
    }
    if provider_attr {
        order.push(QpStrategy::ProviderAttr);
    }
    if config.use_init_attr_ex {
        order.push(QpStrategy::AttrEx);
    }
    if config.skip_pd {
        order.retain(|s| !s.carries_pd());
    }
    order
}

/// Something a queue pair can be created against: a protection domain directly, or a CM id.
pub trait QpTarget {
    fn verbs(&self) -> Arc<dyn Verbs>;
    fn create(&self, args: QpCreateArgs<'_>) -> std::result::Result<Option<QpDesc>, VerbsError>;

    /// Where a build that returns nothing from creation leaves the queue pair.
    fn attached(&self) -> Option<QpDesc> {
        None
    }

    /// Whether [`QpTarget::provider_attr`] is worth a strategy of its own.
    fn offers_provider_attr(&self) -> bool {
        false
    }

    /// Creation attributes the target would choose itself, if it can say. Asked only when the
    /// strategy that uses them is reached.
    fn provider_attr(&self) -> Option<std::result::Result<QpInitAttr, VerbsError>> {
        None
    }
}

impl<'ctx> QpTarget for ProtectionDomain<'ctx> {
    fn verbs(&self) -> Arc<dyn Verbs> {
        Arc::clone(ProtectionDomain::verbs(self))
    }

    fn create(&self, args: QpCreateArgs<'_>) -> std::result::Result<Option<QpDesc>, VerbsError> {
        ProtectionDomain::verbs(self).create_qp(args)
    }
}

impl<'ec> QpTarget for CmId<'ec> {
    fn verbs(&self) -> Arc<dyn Verbs> {
        CmId::verbs(self)
    }

    fn create(&self, args: QpCreateArgs<'_>) -> std::result::Result<Option<QpDesc>, VerbsError> {
        self.create_qp(args)
    }

    fn attached(&self) -> Option<QpDesc> {
        self.qp()
    }

    fn offers_provider_attr(&self) -> bool {
        true
    }

    fn provider_attr(&self) -> Option<std::result::Result<QpInitAttr, VerbsError>> {
        Some(self.init_qp_attr())
    }
}

/// The resources a new queue pair should be bound to.
#[derive(Debug, Clone, Copy)]
pub struct QpRequest<'a, 'ctx> {
    pub pd: &'a ProtectionDomain<'ctx>,
    pub send_cq: &'a CompletionQueue<'ctx>,
    pub recv_cq: &'a CompletionQueue<'ctx>,
    pub cap: QpCapability,
    pub sq_sig_all: bool,
}

impl<'a, 'ctx> QpRequest<'a, 'ctx> {
    pub fn new(pd: &'a ProtectionDomain<'ctx>, cq: &'a CompletionQueue<'ctx>, cap: QpCapability) -> Self {
        QpRequest {
            pd,
            send_cq: cq,
            recv_cq: cq,
            cap,
            sq_sig_all: false,
        }
    }

    fn full_attr(&self) -> QpInitAttr {
        QpInitAttr {
            qp_type: QpType::RC,
            send_cq: Some(self.send_cq.handle()),
            recv_cq: Some(self.recv_cq.handle()),
            cap: Some(self.cap),
            sq_sig_all: Some(self.sq_sig_all),
        }
    }

    fn initial_attr(&self, config: &CascadeConfig) -> QpInitAttr {
        let mut attr = self.full_attr();
        if config.skip_cap {
            attr.cap = None;
        }
        if config.skip_cq {
            attr.send_cq = None;
            attr.recv_cq = None;
        }
        attr
    }
}

/// Build a reliable-connection queue pair against `target`, trying strategies in configured
/// order.
///
/// The returned queue pair carries the completion-queue bindings the provider actually made,
/// which may differ from the requested ones when a strategy without bindings succeeded.
pub fn build_qp<'a, 'ctx, T: QpTarget + ?Sized>(
    target: &T,
    request: &QpRequest<'a, 'ctx>,
    config: &CascadeConfig,
) -> Result<Constructed<QueuePair<'a>>> {
    let mut cascade = Cascade::new("queue pair");
    let pd = request.pd.handle();
    let attr = request.initial_attr(config);
    let no_cap = QpInitAttr {
        cap: None,
        ..attr.clone()
    };
    let no_cq = QpInitAttr {
        send_cq: None,
        recv_cq: None,
        ..no_cap.clone()
    };
    let empty = QpInitAttr::default();

    for strategy in qp_strategies(config, target.offers_provider_attr()) {
        let (shape, result) = match strategy {
            QpStrategy::PdAndAttr => try_create(target, QpCreateArgs::PdAndAttr(pd, &attr)),
            QpStrategy::Attr => try_create(target, QpCreateArgs::Attr(&attr)),
            QpStrategy::Pd => try_create(target, QpCreateArgs::Pd(pd)),
            QpStrategy::None => try_create(target, QpCreateArgs::Empty),
            QpStrategy::AttrNoCap => try_create(target, QpCreateArgs::Attr(&no_cap)),
            QpStrategy::AttrNoCq => try_create(target, QpCreateArgs::Attr(&no_cq)),
            QpStrategy::AttrEmpty => try_create(target, QpCreateArgs::Attr(&empty)),
            QpStrategy::ProviderAttr => match target.provider_attr() {
                Some(Ok(provided)) => {
                    let merged = merge_attr(provided, &attr);
                    try_create(target, QpCreateArgs::Attr(&merged))
                }
                Some(Err(e)) => ("(attr)".to_owned(), Err(e)),
                None => continue,
            },
            QpStrategy::AttrEx => try_create(target, QpCreateArgs::Extended(pd, &attr)),
        };
        let outcome = Outcome::classify(result, || target.attached());
        if let Some(built) = cascade.attempt(strategy.name(), shape, outcome)? {
            let qp = QueuePair::from_desc(target.verbs(), built.value);
            if qp.send_cq() != request.send_cq.handle() {
                tracing::warn!(
                    "qp {:#x} bound to send cq {} instead of {}",
                    qp.qp_num(),
                    qp.send_cq(),
                    request.send_cq.handle()
                );
            }
            return Ok(Constructed {
                value: qp,
                strategy: built.strategy,
                attempts: built.attempts,
            });
        }
    }
    Err(cascade.exhausted())
}

fn try_create<T: QpTarget + ?Sized>(
    target: &T,
    args: QpCreateArgs<'_>,
) -> (String, std::result::Result<Option<QpDesc>, VerbsError>) {
    (args.shape().to_string(), target.create(args))
}

/// Start from what the provider prepared and layer our bindings and hints on top.
fn merge_attr(mut provided: QpInitAttr, ours: &QpInitAttr) -> QpInitAttr {
    provided.qp_type = ours.qp_type;
    provided.send_cq = ours.send_cq.or(provided.send_cq);
    provided.recv_cq = ours.recv_cq.or(provided.recv_cq);
    provided.cap = ours.cap.or(provided.cap);
    provided.sq_sig_all = ours.sq_sig_all.or(provided.sq_sig_all);
    provided
}

/// Register `buf` for `access`: in place when the provider allows it, otherwise in provider
/// memory initialised with a copy of `buf`. Either way, access the data through the returned
/// region.
pub fn register_mr<'a>(
    pd: &'a ProtectionDomain<'_>,
    buf: &'a mut [u8],
    access: AccessFlags,
) -> Result<Constructed<MemoryRegion<'a>>> {
    let mut cascade = Cascade::new("memory region");
    let len = buf.len();

    let buf = match pd.try_reg_mr(buf, access) {
        Ok(mr) => return Ok(cascade.succeeded("buffer", "(pd, buf)", mr)),
        Err((e, buf)) => {
            let outcome = Outcome::<MemoryRegion<'a>>::classify(Err(e), || None);
            cascade.attempt("buffer", "(pd, buf)", outcome)?;
            buf
        }
    };

    let result = pd.alloc_mr(len, access).map(|mut mr| {
        mr.copy_from_slice(buf);
        Some(mr)
    });
    match cascade.attempt("alloc-copy", "(pd, len)", Outcome::classify(result, || None))? {
        Some(built) => Ok(built),
        None => Err(cascade.exhausted()),
    }
}
