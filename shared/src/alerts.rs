use serde_json::Value;
use std::sync::Arc;

use crate::gateway::{DataGateway, GatewayError, GatewayRequest, GatewayResponse, LiveSync, ShadowQuery};
use crate::model::{Alert, ALERTS};
use crate::watchlist::{decode, Classified};

pub const RECENT_ALERTS_LIMIT: usize = 20;

pub struct AlertsApi {
    gateway: Arc<DataGateway>,
}

impl AlertsApi {
    pub fn new(gateway: Arc<DataGateway>) -> Self {
        Self { gateway }
    }

    /// Latest alerts; the last live answer is mirrored for offline reads.
    pub async fn recent(&self) -> Result<Classified<Vec<Alert>>, GatewayError> {
        let request = GatewayRequest::get(format!("/alerts?limit={RECENT_ALERTS_LIMIT}"))
            .fallback(ShadowQuery::All(ALERTS.into()))
            .on_live(LiveSync::ReplaceFromResponse {
                collection: ALERTS.into(),
                pointer: "/alerts".into(),
            });

        match self.gateway.execute(request).await? {
            GatewayResponse::Live(mut body) => {
                let alerts = body
                    .get_mut("alerts")
                    .map(Value::take)
                    .unwrap_or_else(|| Value::Array(Vec::new()));
                Ok(Classified::Live(decode(alerts)?))
            }
            GatewayResponse::Fallback(v) => Ok(Classified::Fallback(decode(v)?)),
            GatewayResponse::Queued { .. } => Err(GatewayError::Decode("read was queued".into())),
        }
    }
}
