//! Scripted in-memory exchange
//!
//! Implements every API trait against canned state so services and the
//! order coordinator can be exercised without a network. Fetches return the
//! currently configured result; mutations pop a scripted response or fall
//! back to a success with a generated order id. Every call is recorded.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::api::{
    AccountApi, AmendOrderRequest, ApiResponse, CancelOrderRequest, InstrumentApi, OrderAck,
    PlaceOrderRequest, TradingApi, TradingStopRequest,
};
use crate::error::{TerminalError, TerminalResult};
use crate::market::{PriceQuote, SymbolInfo};
use crate::order::{Order, OrderId};
use crate::position::Position;

/// A call observed by the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    GetPositions(String),
    GetOpenOrders(String),
    GetWalletBalance,
    GetTicker(String),
    PlaceOrder(PlaceOrderRequest),
    CancelOrder(CancelOrderRequest),
    AmendOrder(AmendOrderRequest),
    SetTradingStop(TradingStopRequest),
    ListInstruments,
}

impl MockCall {
    /// Whether this call mutates exchange state
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            MockCall::PlaceOrder(_)
                | MockCall::CancelOrder(_)
                | MockCall::AmendOrder(_)
                | MockCall::SetTradingStop(_)
        )
    }
}

#[derive(Debug)]
struct MockState {
    positions: TerminalResult<Vec<Position>>,
    orders: TerminalResult<Vec<Order>>,
    balance: TerminalResult<Decimal>,
    ticker: TerminalResult<Decimal>,
    instruments: TerminalResult<Vec<SymbolInfo>>,
    place_responses: VecDeque<TerminalResult<ApiResponse<OrderAck>>>,
    cancel_responses: VecDeque<TerminalResult<ApiResponse<OrderAck>>>,
    amend_responses: VecDeque<TerminalResult<ApiResponse<OrderAck>>>,
    stop_responses: VecDeque<TerminalResult<ApiResponse<()>>>,
    calls: Vec<MockCall>,
    next_order_id: u64,
}

/// In-memory exchange with scripted responses
#[derive(Debug)]
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                positions: Ok(Vec::new()),
                orders: Ok(Vec::new()),
                balance: Ok(Decimal::ZERO),
                ticker: Err(TerminalError::not_found("No ticker configured")),
                instruments: Ok(Vec::new()),
                place_responses: VecDeque::new(),
                cancel_responses: VecDeque::new(),
                amend_responses: VecDeque::new(),
                stop_responses: VecDeque::new(),
                calls: Vec::new(),
                next_order_id: 1,
            }),
        }
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        self.state.lock().positions = Ok(positions);
    }

    pub fn fail_positions(&self, error: TerminalError) {
        self.state.lock().positions = Err(error);
    }

    pub fn set_orders(&self, orders: Vec<Order>) {
        self.state.lock().orders = Ok(orders);
    }

    pub fn fail_orders(&self, error: TerminalError) {
        self.state.lock().orders = Err(error);
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().balance = Ok(balance);
    }

    pub fn fail_balance(&self, error: TerminalError) {
        self.state.lock().balance = Err(error);
    }

    pub fn set_ticker(&self, price: Decimal) {
        self.state.lock().ticker = Ok(price);
    }

    pub fn set_instruments(&self, instruments: Vec<SymbolInfo>) {
        self.state.lock().instruments = Ok(instruments);
    }

    pub fn fail_instruments(&self, error: TerminalError) {
        self.state.lock().instruments = Err(error);
    }

    /// Queue the response for the next `place_order` call
    pub fn push_place_response(&self, response: TerminalResult<ApiResponse<OrderAck>>) {
        self.state.lock().place_responses.push_back(response);
    }

    pub fn push_cancel_response(&self, response: TerminalResult<ApiResponse<OrderAck>>) {
        self.state.lock().cancel_responses.push_back(response);
    }

    pub fn push_amend_response(&self, response: TerminalResult<ApiResponse<OrderAck>>) {
        self.state.lock().amend_responses.push_back(response);
    }

    pub fn push_trading_stop_response(&self, response: TerminalResult<ApiResponse<()>>) {
        self.state.lock().stop_responses.push_back(response);
    }

    /// All calls observed so far, oldest first
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Number of order/position mutations attempted
    pub fn mutation_count(&self) -> usize {
        self.state.lock().calls.iter().filter(|c| c.is_mutation()).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: MockCall) {
        self.state.lock().calls.push(call);
    }

    fn generated_ack(
        state: &mut MockState,
        order_link_id: Option<String>,
    ) -> ApiResponse<OrderAck> {
        let id = OrderId::new(format!("mock-{}", state.next_order_id));
        state.next_order_id += 1;
        ApiResponse::success(OrderAck {
            order_id: id,
            order_link_id,
        })
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountApi for MockExchange {
    async fn get_positions(&self, symbol: &str) -> TerminalResult<ApiResponse<Vec<Position>>> {
        self.record(MockCall::GetPositions(symbol.to_string()));
        let state = self.state.lock();
        state.positions.clone().map(|positions| {
            ApiResponse::success(
                positions
                    .into_iter()
                    .filter(|p| p.symbol == symbol)
                    .collect(),
            )
        })
    }

    async fn get_open_orders(&self, symbol: &str) -> TerminalResult<ApiResponse<Vec<Order>>> {
        self.record(MockCall::GetOpenOrders(symbol.to_string()));
        let state = self.state.lock();
        state.orders.clone().map(|orders| {
            ApiResponse::success(orders.into_iter().filter(|o| o.symbol == symbol).collect())
        })
    }

    async fn get_wallet_balance(&self) -> TerminalResult<ApiResponse<Decimal>> {
        self.record(MockCall::GetWalletBalance);
        self.state.lock().balance.clone().map(ApiResponse::success)
    }

    async fn get_ticker(&self, symbol: &str) -> TerminalResult<ApiResponse<PriceQuote>> {
        self.record(MockCall::GetTicker(symbol.to_string()));
        let state = self.state.lock();
        state
            .ticker
            .clone()
            .map(|price| ApiResponse::success(PriceQuote::from_poll(symbol, price)))
    }
}

#[async_trait]
impl TradingApi for MockExchange {
    async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> TerminalResult<ApiResponse<OrderAck>> {
        self.record(MockCall::PlaceOrder(request.clone()));
        let mut state = self.state.lock();
        let scripted = state.place_responses.pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(Self::generated_ack(&mut state, request.order_link_id.clone())),
        }
    }

    async fn cancel_order(
        &self,
        request: &CancelOrderRequest,
    ) -> TerminalResult<ApiResponse<OrderAck>> {
        self.record(MockCall::CancelOrder(request.clone()));
        let mut state = self.state.lock();
        let scripted = state.cancel_responses.pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(ApiResponse::success(OrderAck {
                order_id: request.order_id.clone(),
                order_link_id: None,
            })),
        }
    }

    async fn amend_order(
        &self,
        request: &AmendOrderRequest,
    ) -> TerminalResult<ApiResponse<OrderAck>> {
        self.record(MockCall::AmendOrder(request.clone()));
        let mut state = self.state.lock();
        let scripted = state.amend_responses.pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(ApiResponse::success(OrderAck {
                order_id: request.order_id.clone(),
                order_link_id: None,
            })),
        }
    }

    async fn set_trading_stop(
        &self,
        request: &TradingStopRequest,
    ) -> TerminalResult<ApiResponse<()>> {
        self.record(MockCall::SetTradingStop(request.clone()));
        let mut state = self.state.lock();
        let scripted = state.stop_responses.pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(ApiResponse::success(())),
        }
    }
}

#[async_trait]
impl InstrumentApi for MockExchange {
    async fn list_instruments(&self) -> TerminalResult<ApiResponse<Vec<SymbolInfo>>> {
        self.record(MockCall::ListInstruments);
        self.state.lock().instruments.clone().map(ApiResponse::success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{OrderSide, OrderType};
    use rust_decimal_macros::dec;

    fn place(symbol: &str) -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            qty: dec!(1),
            price: None,
            reduce_only: false,
            order_link_id: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_responses_are_consumed_in_order() {
        let exchange = MockExchange::new();
        exchange.push_place_response(Ok(ApiResponse::rejected(110001, "order not exists")));

        let first = exchange.place_order(&place("BTCUSDT")).await.unwrap();
        assert_eq!(first.code, 110001);

        let second = exchange.place_order(&place("BTCUSDT")).await.unwrap();
        assert!(second.is_success());
        assert_eq!(second.result.unwrap().order_id, OrderId::new("mock-1"));

        assert_eq!(exchange.mutation_count(), 2);
    }

    #[tokio::test]
    async fn test_fetches_are_scoped_to_symbol() {
        let exchange = MockExchange::new();
        exchange.set_balance(dec!(1500));
        exchange.fail_orders(TerminalError::network("timeout"));

        let positions = exchange.get_positions("ETHUSDT").await.unwrap();
        assert_eq!(positions.result.unwrap().len(), 0);
        assert!(exchange.get_open_orders("ETHUSDT").await.is_err());
        assert_eq!(
            exchange.get_wallet_balance().await.unwrap().into_result(),
            Ok(dec!(1500))
        );
        assert_eq!(exchange.mutation_count(), 0);
        assert_eq!(exchange.calls().len(), 3);
    }
}
