//! Ordered list of the modern handlers.
//!
//! The factory asks each handler in turn and keeps the first match, so the
//! order matters: specific name matches come first, the generic Standard
//! Weight Profile last since almost every scale advertises one of its services.

use super::aaax::AaaxHandler;
use super::ihealth_hs3::IHealthHs3Handler;
use super::mi_scale::MiScaleHandler;
use super::one_byone::OneByoneHandler;
use super::qn::QnHandler;
use super::s400::MiScaleS400Handler;
use super::soehnle::SoehnleHandler;
use super::standard_weight::StandardWeightProfileHandler;
use super::trisa::TrisaBodyAnalyzeHandler;
use super::yoda::YodaHandler;
use super::ScaleDeviceHandler;

/// Fresh handler instances, in matching order.
pub fn handlers() -> Vec<Box<dyn ScaleDeviceHandler>> {
    vec![
        Box::new(MiScaleS400Handler::new()),
        Box::new(YodaHandler::new()),
        Box::new(AaaxHandler::new()),
        Box::new(IHealthHs3Handler::new()),
        Box::new(MiScaleHandler::new()),
        Box::new(QnHandler::new()),
        Box::new(OneByoneHandler::new()),
        Box::new(SoehnleHandler::new()),
        Box::new(TrisaBodyAnalyzeHandler::new()),
        Box::new(StandardWeightProfileHandler::new()),
    ]
}
