//! Payment service seam: reserve / check / refund / approval RPCs.

use std::sync::Arc;

use anchorage_primitives::{ByteCount, NativeAddress, Winston};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

/// A successful reservation: who paid, for whom, and how much was assessed.
///
/// When `paying_address` differs from `owner`, the reservation consumed a
/// paid-by approval; compensation must revoke it alongside the refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceReservation {
    pub paying_address: NativeAddress,
    pub owner: NativeAddress,
    pub assessed_winc: Winston,
}

impl BalanceReservation {
    /// True when a paid-by approval was consumed.
    pub fn used_paid_by(&self) -> bool {
        self.paying_address != self.owner
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PaymentError {
    /// 402 territory.
    #[error("insufficient balance")]
    Insufficient,
    /// 503 territory; nothing was charged.
    #[error("payment service unreachable: {message}")]
    Unreachable { message: String },
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Cheap pre-check before any byte is persisted. Errs with
    /// [`PaymentError::Insufficient`] when the declared size cannot be
    /// covered by the owner or any paid-by candidate.
    async fn check_balance(
        &self,
        owner: &NativeAddress,
        paid_by: &[NativeAddress],
        byte_count: ByteCount,
    ) -> Result<(), PaymentError>;

    /// Reserves the assessed price, trying paid-by addresses in order before
    /// falling back to the owner.
    async fn reserve_balance(
        &self,
        owner: &NativeAddress,
        paid_by: &[NativeAddress],
        byte_count: ByteCount,
    ) -> Result<BalanceReservation, PaymentError>;

    /// Compensates a reservation after a late failure.
    async fn refund_balance(
        &self,
        address: &NativeAddress,
        winc: Winston,
    ) -> Result<(), PaymentError>;

    /// Whether `payer` has approved paying on behalf of `owner`.
    async fn check_approval(
        &self,
        payer: &NativeAddress,
        owner: &NativeAddress,
    ) -> Result<bool, PaymentError>;

    /// Releases the approval a failed upload consumed, so the payer's grant
    /// is not burned by an upload that never produced a receipt.
    async fn revoke_approval(
        &self,
        payer: &NativeAddress,
        owner: &NativeAddress,
    ) -> Result<(), PaymentError>;
}

/// REST client against the payment service.
#[derive(Debug, Clone)]
pub struct HttpPaymentService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ReserveResponse {
    winc: Winston,
    #[serde(rename = "payingAddress")]
    paying_address: String,
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    approved: bool,
}

impl HttpPaymentService {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn unreachable(error: reqwest::Error) -> PaymentError {
        PaymentError::Unreachable {
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl PaymentService for HttpPaymentService {
    async fn check_balance(
        &self,
        owner: &NativeAddress,
        paid_by: &[NativeAddress],
        byte_count: ByteCount,
    ) -> Result<(), PaymentError> {
        let url = format!("{}/v1/check-balance/{owner}/{byte_count}", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[("paidBy", join_addresses(paid_by))])
            .send()
            .await
            .map_err(Self::unreachable)?;
        match response.status().as_u16() {
            200 => Ok(()),
            402 => Err(PaymentError::Insufficient),
            status => Err(PaymentError::Unreachable {
                message: format!("check-balance returned {status}"),
            }),
        }
    }

    async fn reserve_balance(
        &self,
        owner: &NativeAddress,
        paid_by: &[NativeAddress],
        byte_count: ByteCount,
    ) -> Result<BalanceReservation, PaymentError> {
        let url = format!("{}/v1/reserve-balance/{owner}/{byte_count}", self.base_url);
        let response = self
            .client
            .post(url)
            .query(&[("paidBy", join_addresses(paid_by))])
            .send()
            .await
            .map_err(Self::unreachable)?;
        match response.status().as_u16() {
            200 => {
                let body: ReserveResponse =
                    response.json().await.map_err(Self::unreachable)?;
                Ok(BalanceReservation {
                    paying_address: NativeAddress::from_rendered(body.paying_address),
                    owner: owner.clone(),
                    assessed_winc: body.winc,
                })
            }
            402 => Err(PaymentError::Insufficient),
            status => Err(PaymentError::Unreachable {
                message: format!("reserve-balance returned {status}"),
            }),
        }
    }

    async fn refund_balance(
        &self,
        address: &NativeAddress,
        winc: Winston,
    ) -> Result<(), PaymentError> {
        let url = format!("{}/v1/refund-balance/{address}/{winc}", self.base_url);
        let response = self.client.post(url).send().await.map_err(Self::unreachable)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PaymentError::Unreachable {
                message: format!("refund-balance returned {}", response.status()),
            })
        }
    }

    async fn check_approval(
        &self,
        payer: &NativeAddress,
        owner: &NativeAddress,
    ) -> Result<bool, PaymentError> {
        let url = format!("{}/v1/approval/{payer}/{owner}", self.base_url);
        let response = self.client.get(url).send().await.map_err(Self::unreachable)?;
        if !response.status().is_success() {
            return Err(PaymentError::Unreachable {
                message: format!("approval returned {}", response.status()),
            });
        }
        let body: ApprovalResponse = response.json().await.map_err(Self::unreachable)?;
        Ok(body.approved)
    }

    async fn revoke_approval(
        &self,
        payer: &NativeAddress,
        owner: &NativeAddress,
    ) -> Result<(), PaymentError> {
        let url = format!("{}/v1/revoke-approval/{payer}/{owner}", self.base_url);
        let response = self.client.post(url).send().await.map_err(Self::unreachable)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PaymentError::Unreachable {
                message: format!("revoke-approval returned {}", response.status()),
            })
        }
    }
}

fn join_addresses(addresses: &[NativeAddress]) -> String {
    addresses
        .iter()
        .map(NativeAddress::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Payment double for tests and for `SKIP_BALANCE_CHECKS` deployments:
/// everything is funded, every charge is zero winc.
#[derive(Debug, Default)]
pub struct AllowAllPayment {
    refunds: Mutex<Vec<(NativeAddress, Winston)>>,
}

impl AllowAllPayment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refunds(&self) -> Vec<(NativeAddress, Winston)> {
        self.refunds.lock().clone()
    }
}

#[async_trait]
impl PaymentService for AllowAllPayment {
    async fn check_balance(
        &self,
        _owner: &NativeAddress,
        _paid_by: &[NativeAddress],
        _byte_count: ByteCount,
    ) -> Result<(), PaymentError> {
        Ok(())
    }

    async fn reserve_balance(
        &self,
        owner: &NativeAddress,
        _paid_by: &[NativeAddress],
        _byte_count: ByteCount,
    ) -> Result<BalanceReservation, PaymentError> {
        Ok(BalanceReservation {
            paying_address: owner.clone(),
            owner: owner.clone(),
            assessed_winc: Winston::ZERO,
        })
    }

    async fn refund_balance(
        &self,
        address: &NativeAddress,
        winc: Winston,
    ) -> Result<(), PaymentError> {
        self.refunds.lock().push((address.clone(), winc));
        Ok(())
    }

    async fn check_approval(
        &self,
        _payer: &NativeAddress,
        _owner: &NativeAddress,
    ) -> Result<bool, PaymentError> {
        Ok(true)
    }

    async fn revoke_approval(
        &self,
        _payer: &NativeAddress,
        _owner: &NativeAddress,
    ) -> Result<(), PaymentError> {
        Ok(())
    }
}

/// Scripted payment double: fixed price, optional failures, full charge log.
/// The at-most-once-charge tests assert against its ledger.
#[derive(Debug)]
pub struct ScriptedPayment {
    pub price: Winston,
    mode: Mutex<ScriptedMode>,
    deny_approvals: Mutex<bool>,
    fail_revokes: Mutex<bool>,
    charges: Mutex<Vec<(NativeAddress, Winston)>>,
    refunds: Mutex<Vec<(NativeAddress, Winston)>>,
    revokes: Mutex<Vec<(NativeAddress, NativeAddress)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedMode {
    Funded,
    Insufficient,
    /// Pre-check passes, reserve then reports insufficient.
    InsufficientOnReserve,
    Unreachable,
}

impl ScriptedPayment {
    pub fn new(price: Winston) -> Arc<Self> {
        Arc::new(Self {
            price,
            mode: Mutex::new(ScriptedMode::Funded),
            deny_approvals: Mutex::new(false),
            fail_revokes: Mutex::new(false),
            charges: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
            revokes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: ScriptedMode) {
        *self.mode.lock() = mode;
    }

    /// Makes every approval lookup come back denied.
    pub fn deny_approvals(&self, deny: bool) {
        *self.deny_approvals.lock() = deny;
    }

    /// Makes every revocation attempt fail.
    pub fn fail_revokes(&self, fail: bool) {
        *self.fail_revokes.lock() = fail;
    }

    pub fn revokes(&self) -> Vec<(NativeAddress, NativeAddress)> {
        self.revokes.lock().clone()
    }

    pub fn charges(&self) -> Vec<(NativeAddress, Winston)> {
        self.charges.lock().clone()
    }

    pub fn refunds(&self) -> Vec<(NativeAddress, Winston)> {
        self.refunds.lock().clone()
    }

    /// Net winc the user is out after all charges and refunds.
    pub fn net_charged(&self) -> u128 {
        let charged: u128 = self.charges.lock().iter().map(|(_, w)| w.0).sum();
        let refunded: u128 = self.refunds.lock().iter().map(|(_, w)| w.0).sum();
        charged - refunded.min(charged)
    }
}

#[async_trait]
impl PaymentService for ScriptedPayment {
    async fn check_balance(
        &self,
        _owner: &NativeAddress,
        _paid_by: &[NativeAddress],
        _byte_count: ByteCount,
    ) -> Result<(), PaymentError> {
        match *self.mode.lock() {
            ScriptedMode::Insufficient => Err(PaymentError::Insufficient),
            ScriptedMode::Unreachable => Err(PaymentError::Unreachable {
                message: "scripted outage".into(),
            }),
            _ => Ok(()),
        }
    }

    async fn reserve_balance(
        &self,
        owner: &NativeAddress,
        paid_by: &[NativeAddress],
        _byte_count: ByteCount,
    ) -> Result<BalanceReservation, PaymentError> {
        match *self.mode.lock() {
            ScriptedMode::Insufficient | ScriptedMode::InsufficientOnReserve => {
                Err(PaymentError::Insufficient)
            }
            ScriptedMode::Unreachable => Err(PaymentError::Unreachable {
                message: "scripted outage".into(),
            }),
            ScriptedMode::Funded => {
                let payer = paid_by.first().unwrap_or(owner).clone();
                self.charges.lock().push((payer.clone(), self.price));
                Ok(BalanceReservation {
                    paying_address: payer,
                    owner: owner.clone(),
                    assessed_winc: self.price,
                })
            }
        }
    }

    async fn refund_balance(
        &self,
        address: &NativeAddress,
        winc: Winston,
    ) -> Result<(), PaymentError> {
        self.refunds.lock().push((address.clone(), winc));
        Ok(())
    }

    async fn check_approval(
        &self,
        _payer: &NativeAddress,
        _owner: &NativeAddress,
    ) -> Result<bool, PaymentError> {
        if *self.mode.lock() == ScriptedMode::Unreachable {
            return Err(PaymentError::Unreachable {
                message: "scripted outage".into(),
            });
        }
        Ok(!*self.deny_approvals.lock())
    }

    async fn revoke_approval(
        &self,
        payer: &NativeAddress,
        owner: &NativeAddress,
    ) -> Result<(), PaymentError> {
        if *self.fail_revokes.lock() {
            return Err(PaymentError::Unreachable {
                message: "scripted revoke outage".into(),
            });
        }
        self.revokes.lock().push((payer.clone(), owner.clone()));
        Ok(())
    }
}
