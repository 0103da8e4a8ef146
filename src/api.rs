//! Calls against the trading service, built on a [`Session`].
//!
//! Each call assembles parameters, sends them through the session, and
//! decodes the JSON answer. A status other than the one expected becomes
//! [`Error::Status`] with the raw body attached; a body that does not decode
//! becomes [`Error::Decode`]; retirement errors are passed through untouched.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::Error;
use crate::response::TimedResponse;
use crate::session::Session;

/// Pages and static assets fetched by [`UserClient::top`].
pub const TOP_PAGE_PATHS: &[&str] = &[
    "/",
    "/css/bootstrap-grid.min.css",
    "/css/bootstrap-reboot.min.css",
    "/css/bootstrap.min.css",
    "/js/bootstrap.bundle.min.js",
    "/js/bootstrap.min.js",
    "/js/jquery-3.3.1.slim.min.js",
    "/js/popper.min.js",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Sell,
    Buy,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Sell => "sell",
            TradeType::Buy => "buy",
        }
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub amount: i64,
    pub price: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: TradeType,
    #[serde(default)]
    pub user_id: i64,
    pub amount: i64,
    pub price: i64,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trade_id: i64,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub trade: Option<Trade>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandlestickData {
    pub time: DateTime<Utc>,
    pub open: i64,
    pub close: i64,
    pub high: i64,
    pub low: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub cursor: i64,
    #[serde(default)]
    pub traded_orders: Vec<Order>,
    #[serde(default)]
    pub lowest_sell_price: i64,
    #[serde(default)]
    pub highest_buy_price: i64,
    #[serde(default)]
    pub chart_by_sec: Vec<CandlestickData>,
    #[serde(default)]
    pub chart_by_min: Vec<CandlestickData>,
    #[serde(default)]
    pub chart_by_hour: Vec<CandlestickData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderActionResponse {
    pub id: i64,
}

/// Credentials of one simulated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub bank_id: String,
    pub name: String,
    pub password: String,
}

/// A simulated user talking to the trading service.
pub struct UserClient {
    session: Session,
    credentials: Credentials,
    user_id: Option<i64>,
}

impl UserClient {
    pub fn new(session: Session, credentials: Credentials) -> Self {
        Self {
            session,
            credentials,
            user_id: None,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.session.is_retired()
    }

    /// The id learned from a successful sign-in.
    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    pub async fn initialize(
        &mut self,
        bank_endpoint: &str,
        bank_appid: &str,
        log_endpoint: &str,
        log_appid: &str,
    ) -> Result<(), Error> {
        let params = [
            ("bank_endpoint", bank_endpoint),
            ("bank_appid", bank_appid),
            ("log_endpoint", log_endpoint),
            ("log_appid", log_appid),
        ];
        let res = self.session.post("/initialize", &params).await?;
        res.expect_status(StatusCode::OK, "POST /initialize failed.")?;
        Ok(())
    }

    pub async fn signup(&mut self) -> Result<(), Error> {
        let params = [
            ("name", self.credentials.name.as_str()),
            ("bank_id", self.credentials.bank_id.as_str()),
            ("password", self.credentials.password.as_str()),
        ];
        let res = self.session.post("/signup", &params).await?;
        res.expect_status(StatusCode::OK, "POST /signup failed.")?;
        Ok(())
    }

    pub async fn signin(&mut self) -> Result<User, Error> {
        let params = [
            ("bank_id", self.credentials.bank_id.as_str()),
            ("password", self.credentials.password.as_str()),
        ];
        let res = self.session.post("/signin", &params).await?;
        let user: User = res
            .expect_status(StatusCode::OK, "POST /signin failed.")?
            .json("POST /signin")?;
        if user.id == 0 {
            return Err(Error::Unexpected("POST /signin returned zero id".into()));
        }
        self.user_id = Some(user.id);
        Ok(user)
    }

    pub async fn signout(&mut self) -> Result<(), Error> {
        let res = self.session.post("/signout", &[]).await?;
        res.expect_status(StatusCode::OK, "POST /signout failed.")?;
        self.user_id = None;
        Ok(())
    }

    /// Loads the top page and its static assets, as a browser would.
    ///
    /// 304 answers from conditional requests count as success.
    pub async fn top(&mut self) -> Result<Vec<TimedResponse>, Error> {
        let mut responses = Vec::with_capacity(TOP_PAGE_PATHS.len());
        for path in TOP_PAGE_PATHS {
            let res = self.session.get(path, &[]).await?;
            if res.status.as_u16() >= 400 {
                return Err(Error::status(
                    format!("GET {} failed.", path),
                    res.status,
                    &res.body,
                ));
            }
            responses.push(res);
        }
        Ok(responses)
    }

    pub async fn info(&mut self, cursor: i64) -> Result<InfoResponse, Error> {
        let cursor = cursor.to_string();
        let res = self.session.get("/info", &[("cursor", cursor.as_str())]).await?;
        res.expect_ok_or_cached("GET /info failed.")?
            .json("GET /info")
    }

    pub async fn add_order(&mut self, kind: TradeType, amount: i64, price: i64) -> Result<Order, Error> {
        let amount_str = amount.to_string();
        let price_str = price.to_string();
        let params = [
            ("type", kind.as_str()),
            ("amount", amount_str.as_str()),
            ("price", price_str.as_str()),
        ];
        let res = self.session.post("/orders", &params).await?;
        let action: OrderActionResponse = res
            .expect_status(StatusCode::OK, "POST /orders failed.")?
            .json("POST /orders")?;
        if action.id == 0 {
            return Err(Error::Unexpected(
                "POST /orders failed. id is not returned".into(),
            ));
        }

        Ok(Order {
            id: action.id,
            kind,
            user_id: self.user_id.unwrap_or_default(),
            amount,
            price,
            closed_at: None,
            trade_id: 0,
            created_at: None,
            user: None,
            trade: None,
        })
    }

    pub async fn get_orders(&mut self) -> Result<Vec<Order>, Error> {
        let res = self.session.get("/orders", &[]).await?;
        res.expect_ok_or_cached("GET /orders failed.")?
            .json("GET /orders")
    }

    pub async fn delete_order(&mut self, id: i64) -> Result<(), Error> {
        let path = format!("/order/{}", id);
        let res = self.session.delete(&path, &[]).await?;
        let action: OrderActionResponse = res
            .expect_status(StatusCode::OK, &format!("DELETE {} failed.", path))?
            .json(&format!("DELETE {}", path))?;
        if action.id != id {
            return Err(Error::Unexpected(format!(
                "DELETE {} failed. id is not match requested value [got:{}, want:{}]",
                path, action.id, id
            )));
        }
        Ok(())
    }
}
