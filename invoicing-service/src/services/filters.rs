//! Invoiceability filters.
//!
//! Categories run in a fixed order (amount, payment, order shape, catalog,
//! customer, geography, date range) and the first failing rule is returned.
//! A category that is not configured never rejects, and an empty list inside
//! a category means no constraint.

use crate::error::{FilterRejection, InvoicingError};
use crate::models::{
    AmountFilter, CatalogFilter, CustomerFilter, DateRangeFilter, FilterSet, GeographyFilter,
    Order, OrderShapeFilter, PaymentFilter,
};

pub fn evaluate(order: &Order, filters: &FilterSet) -> Result<(), FilterRejection> {
    if let Some(amount) = &filters.amount {
        check_amount(order, amount)?;
    }
    if let Some(payment) = &filters.payment {
        check_payment(order, payment)?;
    }
    if let Some(shape) = &filters.order_shape {
        check_order_shape(order, shape)?;
    }
    if let Some(catalog) = &filters.catalog {
        check_catalog(order, catalog)?;
    }
    if let Some(customer) = &filters.customer {
        check_customer(order, customer)?;
    }
    if let Some(geography) = &filters.geography {
        check_geography(order, geography)?;
    }
    if let Some(range) = &filters.date_range {
        check_date_range(order, range)?;
    }
    Ok(())
}

fn check_amount(order: &Order, filter: &AmountFilter) -> Result<(), FilterRejection> {
    let total = order.total_amount;
    if let Some(min) = filter.min {
        if total < min {
            return Err(FilterRejection::BelowMinimum { total, min });
        }
    }
    if let Some(max) = filter.max {
        if total > max {
            return Err(FilterRejection::AboveMaximum { total, max });
        }
    }
    Ok(())
}

fn check_payment(order: &Order, filter: &PaymentFilter) -> Result<(), FilterRejection> {
    if let Some(required) = filter.status {
        if order.payment_status != required {
            return Err(FilterRejection::NotPaid {
                required: required.as_str().to_string(),
                actual: order.payment_status.as_str().to_string(),
            });
        }
    }
    if !filter.allowed_method_ids.is_empty() {
        let allowed = order
            .payment_method_id
            .is_some_and(|id| filter.allowed_method_ids.contains(&id));
        if !allowed {
            return Err(FilterRejection::PaymentMethodNotAllowed {
                method: order.payment_method_id,
            });
        }
    }
    Ok(())
}

fn check_order_shape(order: &Order, filter: &OrderShapeFilter) -> Result<(), FilterRejection> {
    if !filter.allowed_order_types.is_empty() {
        let allowed = order
            .order_type
            .as_ref()
            .is_some_and(|t| filter.allowed_order_types.contains(t));
        if !allowed {
            return Err(FilterRejection::OrderTypeNotAllowed {
                order_type: order.order_type.clone(),
            });
        }
    }
    if filter.excluded_statuses.contains(&order.status) {
        return Err(FilterRejection::StatusExcluded {
            status: order.status.clone(),
        });
    }

    let count = order.line_count();
    if let Some(min) = filter.min_items {
        if count < min as usize {
            return Err(FilterRejection::MinItems { count, min });
        }
    }
    if let Some(max) = filter.max_items {
        if count > max as usize {
            return Err(FilterRejection::MaxItems { count, max });
        }
    }
    Ok(())
}

fn check_catalog(order: &Order, filter: &CatalogFilter) -> Result<(), FilterRejection> {
    if let Some(item) = order
        .items
        .iter()
        .find(|item| filter.excluded_skus.contains(&item.sku))
    {
        return Err(FilterRejection::ProductExcluded {
            sku: item.sku.clone(),
        });
    }
    if !filter.allowed_skus.is_empty() {
        if let Some(item) = order
            .items
            .iter()
            .find(|item| !filter.allowed_skus.contains(&item.sku))
        {
            return Err(FilterRejection::ProductNotAllowed {
                sku: item.sku.clone(),
            });
        }
    }
    Ok(())
}

fn check_customer(order: &Order, filter: &CustomerFilter) -> Result<(), FilterRejection> {
    let customer = &order.customer;
    if !filter.allowed_customer_types.is_empty() {
        let allowed = customer
            .customer_type
            .as_ref()
            .is_some_and(|t| filter.allowed_customer_types.contains(t));
        if !allowed {
            return Err(FilterRejection::CustomerTypeNotAllowed {
                customer_type: customer.customer_type.clone(),
            });
        }
    }
    if let Some(id) = &customer.customer_id {
        if filter.excluded_customer_ids.contains(id) {
            return Err(FilterRejection::CustomerExcluded {
                customer_id: id.clone(),
            });
        }
    }
    Ok(())
}

fn check_geography(order: &Order, filter: &GeographyFilter) -> Result<(), FilterRejection> {
    if filter.allowed_regions.is_empty() {
        return Ok(());
    }
    let allowed = order.shipping_region.as_ref().is_some_and(|region| {
        filter
            .allowed_regions
            .iter()
            .any(|r| r.eq_ignore_ascii_case(region))
    });
    if allowed {
        Ok(())
    } else {
        Err(FilterRejection::RegionNotAllowed {
            region: order.shipping_region.clone(),
        })
    }
}

fn check_date_range(order: &Order, filter: &DateRangeFilter) -> Result<(), FilterRejection> {
    let date = order.created_utc.date_naive();
    let after_start = filter.start_date.map_or(true, |start| date >= start);
    let before_end = filter.end_date.map_or(true, |end| date <= end);
    if after_start && before_end {
        Ok(())
    } else {
        Err(FilterRejection::OutsideDateRange { date })
    }
}

/// Reject filter sets whose bounds can never be satisfied.
pub fn validate(filters: &FilterSet) -> Result<(), InvoicingError> {
    if let Some(amount) = &filters.amount {
        let negative = amount.min.is_some_and(|v| v.is_sign_negative())
            || amount.max.is_some_and(|v| v.is_sign_negative());
        if negative {
            return Err(InvoicingError::InvalidFilterConfig(
                "amount bounds must not be negative".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (amount.min, amount.max) {
            if min > max {
                return Err(InvoicingError::InvalidFilterConfig(format!(
                    "amount min {} exceeds max {}",
                    min, max
                )));
            }
        }
    }
    if let Some(shape) = &filters.order_shape {
        if let (Some(min), Some(max)) = (shape.min_items, shape.max_items) {
            if min > max {
                return Err(InvoicingError::InvalidFilterConfig(format!(
                    "min_items {} exceeds max_items {}",
                    min, max
                )));
            }
        }
    }
    if let Some(range) = &filters.date_range {
        if let (Some(start), Some(end)) = (range.start_date, range.end_date) {
            if start > end {
                return Err(InvoicingError::InvalidFilterConfig(format!(
                    "start_date {} is after end_date {}",
                    start, end
                )));
            }
        }
    }
    Ok(())
}
